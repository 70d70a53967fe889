//! IPC interface for VirtHID
//!
//! Newline-delimited JSON over a Unix socket. Each socket is one bridge
//! connection: requests are dispatched in order, and subscription reports are
//! pushed as `AsyncResult` responses on the same stream.

use crate::provider::HidProvider;
use crate::task::{Region, StagedTask};
use anyhow::{bail, Result};
use libvirthid::{
    AsyncTarget, Connection, MethodCall, NotifyThrottle, ReportRecord, Selector, Status, TaskId,
    MAX_MAP_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// IPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    /// Bridge request with the client memory it refers to
    ExternalMethod {
        selector: u32,
        scalar_input: Vec<u64>,
        #[serde(default)]
        scalar_output_count: usize,
        #[serde(default)]
        regions: Vec<Region>,
        /// Reference echoed back on asynchronous results
        #[serde(default)]
        async_reference: Option<u64>,
    },
    /// Host-side report injection
    HostReport { name: String, data: Vec<u8> },
}

/// IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    MethodResult {
        code: i32,
        scalar_output: Vec<u64>,
        regions: Vec<Region>,
    },
    AsyncResult {
        reference: u64,
        code: i32,
        args: Vec<u64>,
    },
    Success { message: String },
    Error { message: String },
}

/// IPC server
pub struct VirtHidServer {
    socket_path: PathBuf,
    provider: Arc<HidProvider>,
    throttle: NotifyThrottle,
}

impl VirtHidServer {
    pub fn new(socket_path: PathBuf, provider: Arc<HidProvider>, throttle: NotifyThrottle) -> Self {
        Self {
            socket_path,
            provider,
            throttle,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        info!("VirtHID IPC listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let provider = self.provider.clone();
                    let throttle = self.throttle;

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, provider, throttle).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
}

/// Subscription target writing to the client's socket
struct SocketTarget {
    reference: u64,
    responses: mpsc::UnboundedSender<IpcResponse>,
}

impl AsyncTarget for SocketTarget {
    fn send_async_result(&self, status: Status, args: &[u64]) {
        let _ = self.responses.send(IpcResponse::AsyncResult {
            reference: self.reference,
            code: status.code(),
            args: args.to_vec(),
        });
    }
}

impl Drop for SocketTarget {
    fn drop(&mut self) {
        debug!("Released async target {}", self.reference);
    }
}

async fn handle_client(
    stream: UnixStream,
    provider: Arc<HidProvider>,
    throttle: NotifyThrottle,
) -> Result<()> {
    let session = Uuid::new_v4();
    let pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
    let task_id = TaskId(pid.map_or(0, |pid| pid as u64));
    info!("Session {} attached ({})", session, task_id);

    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<IpcResponse>();

    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let json = serde_json::to_string(&response)?;
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        anyhow::Ok(())
    });

    let task = Arc::new(StagedTask::new(task_id));
    let conn = Connection::new(task.clone(), provider.clone(), throttle);

    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let result = async {
        while reader.read_line(&mut line).await? > 0 {
            let response = match serde_json::from_str::<IpcRequest>(&line) {
                Ok(request) => process_request(request, &conn, &task, &provider, &tx).await,
                Err(e) => IpcResponse::Error { message: e.to_string() },
            };
            if tx.send(response).is_err() {
                break;
            }
            line.clear();
        }
        anyhow::Ok(())
    }
    .await;

    conn.close();
    drop(conn);
    drop(tx);
    match writer_task.await {
        Ok(Err(e)) => debug!("Session {} writer: {}", session, e),
        Err(e) => warn!("Session {} writer task failed: {}", session, e),
        Ok(Ok(())) => {}
    }

    info!("Session {} detached", session);
    result
}

async fn process_request(
    request: IpcRequest,
    conn: &Connection,
    task: &StagedTask,
    provider: &Arc<HidProvider>,
    responses: &mpsc::UnboundedSender<IpcResponse>,
) -> IpcResponse {
    match request {
        IpcRequest::ExternalMethod {
            selector,
            scalar_input,
            scalar_output_count,
            regions,
            async_reference,
        } => {
            if let Err(e) = task.stage(regions) {
                return IpcResponse::Error { message: e.to_string() };
            }

            let mut call = MethodCall::new(scalar_input).with_scalar_outputs(scalar_output_count);
            if let Some(reference) = async_reference {
                call = call.with_async_target(Box::new(SocketTarget {
                    reference,
                    responses: responses.clone(),
                }));
            }

            let result = conn.external_method(selector, call);
            let code = Status::from(&result).code();
            let scalar_output = result.map(|reply| reply.scalar_output).unwrap_or_default();

            match task.collect_written() {
                Ok(regions) => IpcResponse::MethodResult {
                    code,
                    scalar_output,
                    regions,
                },
                Err(e) => IpcResponse::Error { message: e.to_string() },
            }
        }

        IpcRequest::HostReport { name, data } => {
            let provider = provider.clone();
            let delivered =
                tokio::task::spawn_blocking(move || provider.set_report(name.as_bytes(), &data))
                    .await;

            match delivered {
                Ok(Ok(())) => IpcResponse::Success {
                    message: "Report delivered".to_string(),
                },
                Ok(Err(e)) => IpcResponse::Error { message: e.to_string() },
                Err(e) => IpcResponse::Error { message: e.to_string() },
            }
        }
    }
}

/// A bridge request the daemon answered with a failure status
#[derive(Debug, Error)]
#[error("{method} failed: {status}")]
pub struct MethodFailed {
    pub method: &'static str,
    pub status: Status,
}

/// Report pushed to a subscribed client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReportEvent {
    pub reference: u64,
    pub payload: Vec<u8>,
}

/// Client-side placement of request buffers at synthetic addresses
struct RegionLayout {
    next: u64,
    regions: Vec<Region>,
}

impl RegionLayout {
    const BASE: u64 = 0x1000;
    const ALIGN: u64 = 0x1000;

    fn new() -> Self {
        Self { next: Self::BASE, regions: Vec::new() }
    }

    fn reserve(&mut self, length: usize) -> u64 {
        let address = self.next;
        let end = address + length as u64;
        self.next = (end + Self::ALIGN) & !(Self::ALIGN - 1);
        address
    }

    /// Returns the (address, length) scalar pair
    fn input(&mut self, data: &[u8]) -> [u64; 2] {
        // Empty fields are passed as a null range and rejected by the daemon
        if data.is_empty() {
            return [0, 0];
        }
        let address = self.reserve(data.len());
        self.regions.push(Region::input(address, data));
        [address, data.len() as u64]
    }

    fn output(&mut self, length: usize) -> u64 {
        let address = self.reserve(length);
        self.regions.push(Region::output(address, length));
        address
    }
}

/// IPC client holding one bridge connection
pub struct VirtHidClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pending: VecDeque<HostReportEvent>,
    next_reference: u64,
}

impl VirtHidClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            pending: VecDeque::new(),
            next_reference: 1,
        })
    }

    async fn read_response(&mut self) -> Result<IpcResponse> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("Daemon closed the connection");
        }
        Ok(serde_json::from_str(&line)?)
    }

    async fn request(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        let json = serde_json::to_string(&request)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        loop {
            match self.read_response().await? {
                IpcResponse::AsyncResult { reference, code, args } => {
                    // Reports racing the reply are kept for next_report
                    if let Some(event) = report_event(reference, code, &args)? {
                        self.pending.push_back(event);
                    }
                }
                response => return Ok(response),
            }
        }
    }

    async fn call(
        &mut self,
        selector: Selector,
        scalar_input: Vec<u64>,
        scalar_output_count: usize,
        layout: RegionLayout,
        async_reference: Option<u64>,
    ) -> Result<(Vec<u64>, Vec<Region>)> {
        let response = self
            .request(IpcRequest::ExternalMethod {
                selector: selector.as_raw(),
                scalar_input,
                scalar_output_count,
                regions: layout.regions,
                async_reference,
            })
            .await?;

        match response {
            IpcResponse::MethodResult { code, scalar_output, regions } => {
                match Status::from_code(code) {
                    Some(Status::Success) => Ok((scalar_output, regions)),
                    Some(status) => Err(MethodFailed { method: selector.name(), status }.into()),
                    None => bail!("{} failed with unknown code {}", selector.name(), code),
                }
            }
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    pub async fn create(
        &mut self,
        name: &str,
        descriptor: &[u8],
        serial: &str,
        vendor_id: u32,
        product_id: u32,
    ) -> Result<()> {
        let mut layout = RegionLayout::new();
        let mut scalars = Vec::with_capacity(8);
        scalars.extend(layout.input(name.as_bytes()));
        scalars.extend(layout.input(descriptor));
        scalars.extend(layout.input(serial.as_bytes()));
        scalars.extend([u64::from(vendor_id), u64::from(product_id)]);
        self.call(Selector::Create, scalars, 0, layout, None).await?;
        Ok(())
    }

    pub async fn destroy(&mut self, name: &str) -> Result<()> {
        let mut layout = RegionLayout::new();
        let scalars = layout.input(name.as_bytes()).to_vec();
        self.call(Selector::Destroy, scalars, 0, layout, None).await?;
        Ok(())
    }

    pub async fn send(&mut self, name: &str, report: &[u8]) -> Result<()> {
        let mut layout = RegionLayout::new();
        let mut scalars = layout.input(name.as_bytes()).to_vec();
        scalars.extend(layout.input(report));
        self.call(Selector::Send, scalars, 0, layout, None).await?;
        Ok(())
    }

    /// Device names, growing the buffer until the listing fits
    pub async fn list(&mut self) -> Result<Vec<String>> {
        let mut capacity = 64usize;
        loop {
            let mut layout = RegionLayout::new();
            let address = layout.output(capacity);
            let (outputs, regions) = self
                .call(Selector::List, vec![address, capacity as u64], 2, layout, None)
                .await?;

            let needed = outputs.first().copied().unwrap_or(0) as usize;
            if needed > capacity {
                if needed as u64 > MAX_MAP_LENGTH {
                    bail!("Device listing needs {} bytes", needed);
                }
                capacity = needed;
                continue;
            }

            let data = regions
                .iter()
                .find(|r| r.address == address)
                .map(|r| r.data.as_slice())
                .unwrap_or_default();
            let listing = &data[..needed.min(data.len())];
            return Ok(listing
                .split(|b| *b == 0)
                .filter(|entry| !entry.is_empty())
                .map(|entry| String::from_utf8_lossy(entry).into_owned())
                .collect());
        }
    }

    /// Subscribe to a device's host reports; returns the async reference
    pub async fn subscribe(&mut self, name: &str) -> Result<u64> {
        let reference = self.next_reference;
        self.next_reference += 1;

        let mut layout = RegionLayout::new();
        let scalars = layout.input(name.as_bytes()).to_vec();
        self.call(Selector::Subscribe, scalars, 0, layout, Some(reference))
            .await?;
        Ok(reference)
    }

    /// Inject a host-originated report for a device
    pub async fn host_report(&mut self, name: &str, data: &[u8]) -> Result<()> {
        match self
            .request(IpcRequest::HostReport {
                name: name.to_string(),
                data: data.to_vec(),
            })
            .await?
        {
            IpcResponse::Success { .. } => Ok(()),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    /// Wait for the next report pushed to a subscription
    pub async fn next_report(&mut self) -> Result<HostReportEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        loop {
            match self.read_response().await? {
                IpcResponse::AsyncResult { reference, code, args } => {
                    if let Some(event) = report_event(reference, code, &args)? {
                        return Ok(event);
                    }
                }
                other => warn!("Unsolicited response: {:?}", other),
            }
        }
    }
}

fn report_event(reference: u64, code: i32, args: &[u64]) -> Result<Option<HostReportEvent>> {
    if code != Status::Success.code() {
        warn!("Async result {} with status {}", reference, code);
        return Ok(None);
    }
    let Some(record) = ReportRecord::from_words(args) else {
        bail!("Malformed report record");
    };
    Ok(Some(HostReportEvent {
        reference,
        payload: record.payload().to_vec(),
    }))
}
