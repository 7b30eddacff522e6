pub mod aggregator;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod ingestor;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
pub mod recommender;
pub mod server;
pub mod service;
pub mod shared;
pub mod similarity_store;
pub mod stream;
pub mod transport;
pub mod types;
pub mod weights;
