//! downloader-evm — the EVM-specific half of the reorg-safe log downloader:
//! the JSON-RPC client, the Log Fetcher, and the Downloader Orchestrator.

pub mod builder;
pub mod fetcher_loop;
pub mod orchestrator;
pub mod rpc;

pub use builder::DownloaderBuilder;
pub use fetcher_loop::{FetchNextOutcome, LogFetcher};
pub use orchestrator::Orchestrator;
pub use rpc::{FinalityTag, GetLogsFilter, HttpRpcTransport, RpcClient, RpcError, RpcTransport};
