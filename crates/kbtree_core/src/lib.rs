pub mod config;
pub mod document;
pub mod hierarchy;
pub mod ledger;
pub mod markdown;
pub mod model;
pub mod pipeline;
pub mod rewrite;
pub mod runtime;
pub mod source;
pub mod store;
pub mod tree;
