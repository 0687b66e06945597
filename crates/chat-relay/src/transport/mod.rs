//! Realtime transport: WebSocket text frames carrying JSON envelopes.

pub mod websocket;
