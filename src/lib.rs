pub mod audit;
pub mod canvas;
pub mod config;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod output;
pub mod pipeline;
pub mod pricer;
pub mod priors;
pub mod scenarios;
pub mod stress;
pub mod types;
pub mod validator;
