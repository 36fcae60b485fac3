//! Consumer middleware: ordered stages wrapped around every consumer call.

pub mod chain;
pub mod convenience;

pub use chain::{BoxMiddleware, Handler, HandlerRef, MiddlewareCatalog, MiddlewareChain};
pub use convenience::{ConvenienceHandler, ConvenienceLayer, WEBSOCKET_CONNECT};
