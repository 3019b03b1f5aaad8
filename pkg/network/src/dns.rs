use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use pkg_constants::network::{DNS_ANSWER_TTL_SECS, DNS_FORWARD_TIMEOUT_SECS, DNS_MAX_DATAGRAM};
use pkg_router::Router;
use pkg_types::ingress::normalize_host;

/// Names the DNS server answers for itself.
#[async_trait]
pub trait Zone: Send + Sync {
    /// Whether `host` has at least one route.
    async fn is_known(&self, host: &str) -> anyhow::Result<bool>;
    /// Address to answer `client` with.
    fn ip_for(&self, client: IpAddr) -> Option<IpAddr>;
}

#[async_trait]
impl Zone for Router {
    async fn is_known(&self, host: &str) -> anyhow::Result<bool> {
        Router::is_known(self, host).await
    }

    fn ip_for(&self, client: IpAddr) -> Option<IpAddr> {
        Router::ip_for(self, client)
    }
}

/// DNS server for routed hosts.
///
/// Queries for hosts with a route are answered with the router's own
/// address; everything else is forwarded over TCP to an upstream resolver
/// and relayed verbatim.
#[derive(Clone)]
pub struct DnsServer {
    zone: Arc<dyn Zone>,
    listen_addr: SocketAddr,
    upstream: SocketAddr,
    forward_timeout: Duration,
}

impl DnsServer {
    pub fn new(zone: Arc<dyn Zone>, listen_addr: SocketAddr, upstream: SocketAddr) -> Self {
        Self {
            zone,
            listen_addr,
            upstream,
            forward_timeout: Duration::from_secs(DNS_FORWARD_TIMEOUT_SECS),
        }
    }

    /// Bind the UDP socket and serve in the background. Returns the bound
    /// address.
    pub async fn start(self) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        let local = socket.local_addr()?;
        info!(addr = %local, upstream = %self.upstream, "DNS server listening");

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; DNS_MAX_DATAGRAM];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "DNS recv error");
                        continue;
                    }
                };
                let query = buf[..len].to_vec();
                let server = self.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    if let Some(response) = server.handle_query(&query, src).await {
                        if let Err(e) = socket.send_to(&response, src).await {
                            warn!(client = %src, error = %e, "DNS send error");
                        }
                    }
                });
            }
        });

        Ok((local, handle))
    }

    /// Answer one datagram. `None` means drop it.
    pub async fn handle_query(&self, query: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        let request = match Message::from_bytes(query) {
            Ok(m) => m,
            Err(e) => {
                debug!(client = %src, error = %e, "dropping unparseable DNS datagram");
                return None;
            }
        };

        if request.queries().len() != 1 {
            return encode(&reply(&request, ResponseCode::ServFail));
        }
        let question = &request.queries()[0];
        let host = normalize_host(&question.name().to_ascii());

        match self.zone.is_known(&host).await {
            Ok(true) => return encode(&self.answer(&request, question, src.ip())),
            Ok(false) => {}
            Err(e) => {
                warn!(host = %host, stage = "dns-lookup", error = %e, "Route lookup failed");
                return encode(&reply(&request, ResponseCode::ServFail));
            }
        }

        match self.forward(query).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(host = %host, upstream = %self.upstream, stage = "dns-forward", error = %e, "DNS forward failed");
                encode(&reply(&request, ResponseCode::ServFail))
            }
        }
    }

    fn answer(&self, request: &Message, question: &Query, client: IpAddr) -> Message {
        let mut response = reply(request, ResponseCode::NoError);
        response.set_authoritative(true);

        let rdata = match (question.query_type(), self.zone.ip_for(client)) {
            (RecordType::A, Some(IpAddr::V4(v4))) => Some(RData::A(A(v4))),
            (RecordType::A, Some(IpAddr::V6(v6))) => v6.to_ipv4_mapped().map(|v4| RData::A(A(v4))),
            (RecordType::AAAA, Some(IpAddr::V4(v4))) => Some(RData::AAAA(AAAA(v4.to_ipv6_mapped()))),
            (RecordType::AAAA, Some(IpAddr::V6(v6))) => Some(RData::AAAA(AAAA(v6))),
            _ => None,
        };
        if let Some(rdata) = rdata {
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                DNS_ANSWER_TTL_SECS,
                rdata,
            ));
        }
        response
    }

    /// One TCP exchange with the upstream, framed with a 2-byte length.
    async fn forward(&self, query: &[u8]) -> anyhow::Result<Vec<u8>> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.upstream).await?;
            let len = u16::try_from(query.len())?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(query).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut response).await?;
            Ok::<_, anyhow::Error>(response)
        };
        tokio::time::timeout(self.forward_timeout, exchange)
            .await
            .map_err(|_| anyhow::anyhow!("upstream timed out"))?
    }
}

fn reply(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    response.add_queries(request.queries().iter().cloned());
    response
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "DNS encode error");
            None
        }
    }
}
