pub mod engine;
pub mod isolate;
pub mod messenger;
pub mod mux;
pub mod service;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod mock_transport;
