#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod correction;
pub mod data;
pub mod errors;
pub mod jackknife;
pub mod pipeline;
pub mod regression;
pub mod reliability;
pub mod report;
pub mod settings;

// External h^2 estimators live beside the core
#[path = "../heritability/mod.rs"]
pub mod heritability;
