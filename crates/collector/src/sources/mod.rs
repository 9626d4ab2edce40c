//! Upstream adapters.
//!
//! - `binance`: Binance USD-M futures klines, the reference HTTP adapter
//! - `scripted`: deterministic in-process replies
//! - `http`: status and transport error mapping shared by HTTP adapters

pub mod binance;
pub mod http;
pub mod scripted;

pub use binance::{BinanceKlineSource, Interval};
pub use scripted::{FetchCall, ScriptedResponse, ScriptedSource};
