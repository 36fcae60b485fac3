//! Ready-made consumers for common protocols.

pub mod websocket;

pub use websocket::{
    Frame, Json, JsonWebsocketHandler, WebsocketConsumer, WebsocketContext, WebsocketHandler,
    WEBSOCKET_RECEIVE,
};
