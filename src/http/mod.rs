pub mod body;
pub mod response;
pub mod stream;

// Re-exports for convenience
pub use body::OutboundBody;
pub use response::WireResponse;
pub use stream::HttpStream;
