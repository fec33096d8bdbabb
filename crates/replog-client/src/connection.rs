//! One framed connection to a peer

use crate::{ClientError, Result};
use rand::Rng;
use replog_core::{read_message, write_message, Peer, Request, Response};
use tokio::net::TcpStream;

/// A request/response connection to a single peer
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: Peer,
}

impl Connection {
    /// Connect to the peer's RPC endpoint
    pub async fn connect(peer: &Peer) -> Result<Self> {
        let stream = TcpStream::connect(peer.url.socket_addr()).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer: peer.clone(),
        })
    }

    /// The peer this connection talks to
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Send one request under a fresh correlation id
    pub async fn send_request(&mut self, request: &Request) -> Result<u64> {
        let correlation: u64 = rand::thread_rng().gen();
        write_message(&mut self.stream, &request.encode(correlation)).await?;
        Ok(correlation)
    }

    /// Read the next response, which must echo `correlation`
    pub async fn recv_response(&mut self, correlation: u64) -> Result<Response> {
        let frames = read_message(&mut self.stream).await?;
        let (echoed, response) = Response::decode(&frames)?;
        if echoed != correlation {
            return Err(ClientError::OutOfOrder(format!(
                "correlation {} where {} expected",
                echoed, correlation
            )));
        }
        Ok(response)
    }

    /// One request/response round trip
    pub async fn exchange(&mut self, request: &Request) -> Result<Response> {
        let correlation = self.send_request(request).await?;
        self.recv_response(correlation).await
    }
}
