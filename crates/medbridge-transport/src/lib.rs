//! # MedBridge Transport
//!
//! 端点与传输管理: MLLP监听/发送、文件收件箱轮询与发件箱、
//! FHIR HTTP客户端, 以及端点生命周期 (start / stop / test)。
//! 每个MLLP连接一个专属worker, 连接内消息与ACK严格按序。

pub mod endpoint;
pub mod fhir_client;
pub mod file_poller;
pub mod mllp_listener;
pub mod mllp_sender;
pub mod step_transport;

pub use endpoint::{EndpointManager, EndpointStatus, InboundHandler};
pub use fhir_client::FhirClient;
pub use file_poller::{FileOutbox, FilePoller};
pub use mllp_listener::MllpListener;
pub use mllp_sender::MllpSender;
pub use step_transport::DefaultStepTransport;
