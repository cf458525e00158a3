//! Blocking policy client over a websocket
//!
//! On connect the server pushes its metadata as the first frame. After that
//! each inference is one JSON observation frame answered by one JSON result
//! frame, text or binary. A result is an object with an `actions` nested
//! array plus any auxiliary keys; rectangular numeric arrays become
//! [`PolicyField::Array`]. A reply carrying an `error` key, or one that is
//! not JSON at all (a server traceback), is a transport failure.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use ndarray::{ArrayD, IxDyn};
use serde::Serialize;
use serde_json::Value;
use tungstenite::handshake::HandshakeError;
use tungstenite::{Message, WebSocket};

use super::{InferenceResult, Observation, Policy, PolicyField, ServerMetadata};
use crate::{Error, Result};

/// Connection settings for [`WebsocketPolicyClient`]
#[derive(Debug, Clone)]
pub struct WebsocketPolicyConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Upper bound on one request/response round trip
    pub request_timeout: Duration,
}

impl Default for WebsocketPolicyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8000,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct WireObservation<'a> {
    state: &'a [f64],
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<BTreeMap<&'a str, WireFrame<'a>>>,
}

#[derive(Serialize)]
struct WireFrame<'a> {
    width: u32,
    height: u32,
    channels: u8,
    data: &'a [u8],
}

/// Policy client over a persistent websocket
///
/// The socket is opened lazily and dropped after any failure, so the next
/// call reconnects and re-reads the server metadata.
pub struct WebsocketPolicyClient {
    config: WebsocketPolicyConfig,
    socket: Option<WebSocket<TcpStream>>,
    metadata: ServerMetadata,
}

impl WebsocketPolicyClient {
    pub fn new(config: WebsocketPolicyConfig) -> Self {
        Self {
            config,
            socket: None,
            metadata: ServerMetadata::new(),
        }
    }

    /// Websocket URL this client talks to
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.config.host, self.config.port)
    }

    /// Whether a socket is currently open
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn open_tcp(&self) -> Result<TcpStream> {
        let url = self.url();
        let addrs = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("cannot resolve {}: {}", url, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.config.request_timeout))
                        .and_then(|_| stream.set_write_timeout(Some(self.config.request_timeout)))
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| transport_io(&url, e))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => transport_io(&url, e),
            None => Error::Transport(format!("no addresses for {}", url)),
        })
    }

    fn connect(&mut self) -> Result<&mut WebSocket<TcpStream>> {
        if self.socket.is_none() {
            let url = self.url();
            let stream = self.open_tcp()?;
            let mut socket = match tungstenite::client(url.as_str(), stream) {
                Ok((socket, _response)) => socket,
                Err(HandshakeError::Failure(e)) => return Err(transport_ws(&url, e)),
                Err(HandshakeError::Interrupted(_)) => {
                    return Err(Error::Transport(format!("{} handshake timed out", url)))
                }
            };
            self.metadata = match recv_json(&mut socket, &url)? {
                Value::Object(map) => map,
                Value::Null => ServerMetadata::new(),
                other => {
                    return Err(Error::Transport(format!(
                        "metadata is not an object: {}",
                        other
                    )))
                }
            };
            tracing::info!("Connected to policy server at {}", url);
            self.socket = Some(socket);
        }
        self.socket
            .as_mut()
            .ok_or_else(|| Error::Transport("no connection".into()))
    }

    fn call(&mut self, request: &impl Serialize) -> Result<Value> {
        let text = serde_json::to_string(request)?;
        let result = self.exchange(text);
        if result.is_err() {
            self.socket = None;
        }
        result
    }

    fn exchange(&mut self, text: String) -> Result<Value> {
        let url = self.url();
        let socket = self.connect()?;
        socket
            .send(Message::Text(text.into()))
            .map_err(|e| transport_ws(&url, e))?;

        let reply = recv_json(socket, &url)?;
        if let Some(error) = reply.get("error") {
            let message = error.as_str().map_or_else(|| error.to_string(), str::to_owned);
            return Err(Error::Transport(format!("server error: {}", message)));
        }
        Ok(reply)
    }
}

impl Policy for WebsocketPolicyClient {
    fn infer(&mut self, observation: &Observation) -> Result<InferenceResult> {
        let images = observation.images.as_ref().map(|images| {
            images
                .iter()
                .map(|(name, frame)| {
                    (
                        name.as_str(),
                        WireFrame {
                            width: frame.width,
                            height: frame.height,
                            channels: frame.channels,
                            data: &frame.data,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>()
        });
        let request = WireObservation {
            state: &observation.state,
            prompt: &observation.prompt,
            images,
        };
        parse_inference(self.call(&request)?)
    }

    /// The server keeps no per-episode state; the socket stays open.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn metadata(&mut self) -> Result<ServerMetadata> {
        if let Err(e) = self.connect() {
            self.socket = None;
            return Err(e);
        }
        Ok(self.metadata.clone())
    }
}

impl Drop for WebsocketPolicyClient {
    fn drop(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
    }
}

/// Read frames until one carries a payload and decode it as JSON
fn recv_json(socket: &mut WebSocket<TcpStream>, url: &str) -> Result<Value> {
    loop {
        match socket.read().map_err(|e| transport_ws(url, e))? {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|_| Error::Transport(format!("server error: {}", text.trim_end())))
            }
            Message::Binary(data) => {
                return serde_json::from_slice(&data).map_err(|e| {
                    Error::Transport(format!("{} sent a malformed reply: {}", url, e))
                })
            }
            Message::Close(_) => {
                return Err(Error::Transport(format!("{} closed the connection", url)))
            }
            _ => {}
        }
    }
}

fn transport_io(url: &str, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Transport(format!("{} timed out", url)),
        _ => Error::Transport(format!("{}: {}", url, e)),
    }
}

fn transport_ws(url: &str, e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Io(io) => transport_io(url, io),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::Transport(format!("{} closed the connection", url))
        }
        other => Error::Transport(format!("{}: {}", url, other)),
    }
}

fn parse_inference(result: Value) -> Result<InferenceResult> {
    let Value::Object(mut map) = result else {
        return Err(Error::Transport("inference result is not an object".into()));
    };
    let actions = map
        .remove("actions")
        .ok_or_else(|| Error::Transport("inference result has no `actions`".into()))?;
    let actions = json_to_array(&actions)
        .ok_or_else(|| Error::Shape("`actions` is not a rectangular numeric array".into()))?;

    let fields = map
        .into_iter()
        .map(|(name, value)| {
            let field = match json_to_array(&value) {
                Some(a) => PolicyField::Array(a),
                None => PolicyField::Value(value),
            };
            (name, field)
        })
        .collect();
    Ok(InferenceResult { actions, fields })
}

/// Convert a rectangular nested JSON array of numbers into an n-d array
fn json_to_array(value: &Value) -> Option<ArrayD<f64>> {
    if !value.is_array() {
        return None;
    }
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    let mut data = Vec::with_capacity(shape.iter().product());
    flatten(value, &shape, &mut data)?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).ok()
}

fn flatten(value: &Value, shape: &[usize], out: &mut Vec<f64>) -> Option<()> {
    match (value, shape.split_first()) {
        (Value::Number(n), None) => {
            out.push(n.as_f64()?);
            Some(())
        }
        (Value::Array(items), Some((&len, rest))) if items.len() == len => {
            items.iter().try_for_each(|item| flatten(item, rest, out))
        }
        _ => None,
    }
}
