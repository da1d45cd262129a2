//! Candle sources

pub mod binance;
pub mod file;

pub use binance::BinanceClient;
pub use file::FileCandleSource;
