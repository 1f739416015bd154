//! MLLP发送器
//!
//! 首次发送时建连, 发送一帧后同连接读取一帧ACK（默认30秒超时）,
//! 空闲60秒拆连。失败分类为连接拒绝/超时/对端复位/协议错误,
//! 不做隐式重试。

use futures::{SinkExt, StreamExt};
use medbridge_core::models::Endpoint;
use medbridge_core::{BridgeError, Result};
use medbridge_hl7::generator::{parse_ack, AckInfo};
use medbridge_hl7::parser::decode_payload;
use medbridge_hl7::MllpCodec;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// 空闲拆连阈值
const IDLE_TEARDOWN: Duration = Duration::from_secs(60);

type Connection = Framed<TcpStream, MllpCodec>;

/// MLLP发送器（按端点持有连接）
pub struct MllpSender {
    endpoint: Endpoint,
    max_frame_bytes: usize,
    ack_timeout: Duration,
    conn: Mutex<Option<(Connection, Instant)>>,
}

impl MllpSender {
    pub fn new(endpoint: Endpoint, max_frame_bytes: usize) -> Self {
        let ack_timeout = Duration::from_secs(endpoint.ack_timeout_seconds);
        Self {
            endpoint,
            max_frame_bytes,
            ack_timeout,
            conn: Mutex::new(None),
        }
    }

    /// 发送一帧并等待一帧ACK
    pub async fn send(&self, payload: &[u8]) -> Result<AckInfo> {
        let mut guard = self.conn.lock().await;

        // 空闲拆连
        if let Some((_, last_used)) = guard.as_ref() {
            if last_used.elapsed() > IDLE_TEARDOWN {
                debug!(endpoint = %self.endpoint.name, "空闲连接拆除");
                *guard = None;
            }
        }

        if guard.is_none() {
            *guard = Some((self.connect().await?, Instant::now()));
        }
        let (framed, last_used) = guard.as_mut().expect("connection just established");

        if let Err(e) = framed.send(payload.to_vec()).await {
            *guard = None;
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, framed.next()).await {
            Err(_) => {
                *guard = None;
                Err(BridgeError::ReadTimeout(format!(
                    "no ACK within {}s from {}",
                    self.ack_timeout.as_secs(),
                    self.endpoint.name
                )))
            }
            Ok(None) => {
                *guard = None;
                Err(BridgeError::Network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer closed before ACK",
                )))
            }
            Ok(Some(Err(e))) => {
                *guard = None;
                warn!(error = %e, "ACK帧错误");
                Err(e)
            }
            Ok(Some(Ok(bytes))) => {
                *last_used = Instant::now();
                let (text, _) = decode_payload(&bytes);
                parse_ack(&text)
            }
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let host = self
            .endpoint
            .host
            .clone()
            .ok_or_else(|| BridgeError::Config(format!("endpoint {} has no host", self.endpoint.name)))?;
        let port = self
            .endpoint
            .port
            .ok_or_else(|| BridgeError::Config(format!("endpoint {} has no port", self.endpoint.name)))?;
        let stream = tokio::time::timeout(
            Duration::from_secs(10),
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| BridgeError::ReadTimeout(format!("connect to {host}:{port}")))?
        .map_err(|e| BridgeError::ConnectionRefused(format!("{host}:{port}: {e}")))?;
        debug!(endpoint = %self.endpoint.name, "MLLP连接已建立");
        Ok(Framed::new(
            stream,
            MllpCodec::with_max_frame(self.max_frame_bytes),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::models::EndpointKind;
    use medbridge_hl7::generator::{build_ack, AckCode};
    use medbridge_hl7::parser::Hl7Message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// 单连接ACK桩服务端
    async fn spawn_ack_server(ack_code: AckCode, reply: bool) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    loop {
                        // 读一帧
                        let mut buf = Vec::new();
                        let mut byte = [0u8; 1];
                        loop {
                            if stream.read_exact(&mut byte).await.is_err() {
                                return;
                            }
                            buf.push(byte[0]);
                            let n = buf.len();
                            if n >= 2 && buf[n - 2] == 0x1C && buf[n - 1] == 0x0D {
                                break;
                            }
                        }
                        if !reply {
                            continue;
                        }
                        let text = String::from_utf8_lossy(&buf[1..buf.len() - 2]).into_owned();
                        let control_id = Hl7Message::parse(&text)
                            .ok()
                            .and_then(|m| m.control_id().map(String::from))
                            .unwrap_or_default();
                        let ack = build_ack(ack_code, &control_id, "", &[], "SRV", "SRV");
                        let mut framed = vec![0x0B];
                        framed.extend_from_slice(ack.as_bytes());
                        framed.extend_from_slice(&[0x1C, 0x0D]);
                        let _ = stream.write_all(&framed).await;
                    }
                });
            }
        });
        port
    }

    fn sender(port: u16, ack_timeout_seconds: u64) -> MllpSender {
        let mut endpoint = Endpoint::new("target", EndpointKind::MllpSender);
        endpoint.host = Some("127.0.0.1".to_string());
        endpoint.port = Some(port);
        endpoint.ack_timeout_seconds = ack_timeout_seconds;
        MllpSender::new(endpoint, 1024 * 1024)
    }

    const MSG: &str = "MSH|^~\\&|A|B|C|D|20240101000000||ADT^A01|SND01|P|2.5\rPID|1||X\r";

    #[tokio::test]
    async fn test_send_and_receive_ack() {
        let port = spawn_ack_server(AckCode::Aa, true).await;
        let sender = sender(port, 5);
        let ack = sender.send(MSG.as_bytes()).await.unwrap();
        assert_eq!(ack.code, AckCode::Aa);
        assert_eq!(ack.original_control_id.as_deref(), Some("SND01"));

        // 连接复用: 第二次发送
        let ack = sender.send(MSG.as_bytes()).await.unwrap();
        assert_eq!(ack.code, AckCode::Aa);
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let port = spawn_ack_server(AckCode::Aa, false).await;
        let sender = sender(port, 1);
        let err = sender.send(MSG.as_bytes()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ReadTimeout(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let sender = sender(1, 1);
        let err = sender.send(MSG.as_bytes()).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ConnectionRefused(_) | BridgeError::ReadTimeout(_)
        ));
    }
}
