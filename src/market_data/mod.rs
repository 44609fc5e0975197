pub mod candle_buffer;
pub mod kline_stream;
#[cfg(test)]
pub mod mock_transport;
pub mod reconnect;

pub use candle_buffer::{Candle, CandleAccumulator, Series, SeriesRecord};
pub use kline_stream::{StreamConnection, StreamEvent, StreamEventKind, Transport, WsTransport};
pub use reconnect::ReconnectPolicy;
