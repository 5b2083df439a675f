//! Modbus TCP view of the simulated battery.
//!
//! The register image is rebuilt from scratch on every update and swapped in
//! under a single write lock, so a read request always sees the four channels
//! of exactly one update.

pub mod registers;

use log::{debug, error, info, warn};
use registers::{Address, RegisterImage, REGISTER_COUNT};
use std::{
    future, io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use thiserror::Error;
use tokio::{net::TcpListener, select, task::JoinHandle};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tokio_util::sync::CancellationToken;

/// Largest quantity a single read holding registers request may ask for.
const MAX_READ_QUANTITY: u16 = 125;

/// Unit ids that TCP clients commonly use when the gateway has a single unit.
const WILDCARD_UNIT_IDS: [SlaveId; 2] = [0, 255];

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Modbus server already listening on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("Failed to bind Modbus listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

type SharedImage = Arc<RwLock<RegisterImage>>;

fn load(image: &SharedImage) -> RegisterImage {
    *image.read().unwrap_or_else(PoisonError::into_inner)
}

struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RegisterMap {
    image: SharedImage,
    server: Mutex<Option<ServerHandle>>,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterMap {
    pub fn new() -> Self {
        Self {
            image: Arc::new(RwLock::new([0; REGISTER_COUNT])),
            server: Mutex::new(None),
        }
    }

    /// Binds the listener and starts serving the image as unit `slave_id`.
    ///
    /// Returns the address actually bound, which differs from the requested one when `port` is 0.
    pub async fn initialize(&self, slave_id: SlaveId, address: IpAddr, port: u16) -> Result<SocketAddr, ServerError> {
        if let Some(handle) = self.server.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Err(ServerError::AlreadyRunning(handle.local_addr));
        }

        let addr = SocketAddr::new(address, port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let service = RegisterService {
            image: Arc::clone(&self.image),
            slave_id,
        };

        let token = CancellationToken::new();
        let task = tokio::spawn(serve(Server::new(listener), service, token.clone()));

        let mut server = self.server.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = server.as_ref() {
            // lost a race against a concurrent initialize
            token.cancel();
            task.abort();
            return Err(ServerError::AlreadyRunning(running.local_addr));
        }

        *server = Some(ServerHandle { local_addr, token, task });

        info!("Modbus server listening on {local_addr}, unit id {slave_id}");
        Ok(local_addr)
    }

    /// Encodes the four channels and replaces the whole image in one step.
    ///
    /// On failure the previous image stays visible.
    pub fn update(&self, voltage: f64, temperature: f64, current: f64, charge: f64) {
        match registers::encode_image(voltage, temperature, current, charge) {
            Ok(image) => {
                *self.image.write().unwrap_or_else(PoisonError::into_inner) = image;
                debug!(
                    "Updated Modbus registers: voltage={}V temperature={}C current={}A soc={}%",
                    registers::read_channel(&image, &registers::VOLTAGE, registers::VOLTAGE_SCALE),
                    registers::read_channel(&image, &registers::TEMPERATURE, registers::TEMPERATURE_SCALE),
                    registers::read_channel(&image, &registers::CURRENT, registers::CURRENT_SCALE),
                    registers::read_channel(&image, &registers::STATE_OF_CHARGE, registers::STATE_OF_CHARGE_SCALE),
                );
            },
            Err(e) => error!("Failed to update Modbus registers: {e}"),
        }
    }

    /// Reads `count` registers starting at `address` with the same rules the TCP server applies.
    pub fn read(&self, address: Address, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        register_read(&load(&self.image), address, count)
    }

    /// Closes the listener. Calling this more than once, or without a prior
    /// `initialize`, does nothing.
    ///
    /// Connections accepted before the call are served until the client hangs up.
    pub async fn shutdown(&self) {
        let Some(handle) = self.server.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };

        handle.token.cancel();

        match handle.task.await {
            Ok(()) => info!("Modbus server on {} closed", handle.local_addr),
            Err(e) => warn!("Modbus server on {} did not stop cleanly: {e}", handle.local_addr),
        }
    }
}

async fn serve(server: Server, service: RegisterService, token: CancellationToken) {
    let new_service = move |_socket_addr| Ok(Some(service.clone()));

    let on_connected = move |stream, socket_addr| {
        let new_service = new_service.clone();

        async move {
            debug!("Modbus client connected from {socket_addr}");
            accept_tcp_connection(stream, socket_addr, new_service)
        }
    };

    let on_process_error = |err| {
        error!("Modbus connection error: {err}");
    };

    select! {
        res = server.serve(&on_connected, on_process_error) => {
            if let Err(e) = res {
                error!("Modbus server stopped: {e}");
            }
        },
        _ = token.cancelled() => {
            debug!("Modbus server cancelled");
        },
    }
}

#[derive(Clone)]
struct RegisterService {
    image: SharedImage,
    slave_id: SlaveId,
}

impl tokio_modbus::server::Service for RegisterService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;

        if slave != self.slave_id && !WILDCARD_UNIT_IDS.contains(&slave) {
            debug!("Ignoring Modbus request for unit {slave}, serving unit {}", self.slave_id);
            return future::ready(Err(ExceptionCode::GatewayTargetDevice));
        }

        let res = match request {
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!("Reading {cnt} holding registers starting from address {addr}");
                register_read(&load(&self.image), addr, cnt).map(Response::ReadHoldingRegisters)
            },
            _ => {
                debug!("Exception::IllegalFunction - Unimplemented function code in request: {request:?}");
                Err(ExceptionCode::IllegalFunction)
            },
        };

        future::ready(res)
    }
}

fn register_read(image: &RegisterImage, addr: Address, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
    if cnt == 0 || cnt > MAX_READ_QUANTITY {
        debug!("Exception::IllegalDataValue - Invalid register quantity {cnt}");
        return Err(ExceptionCode::IllegalDataValue);
    }

    let start = addr as usize;
    let end = start + cnt as usize;

    image.get(start..end).map(<[u16]>::to_vec).ok_or_else(|| {
        debug!("Exception::IllegalDataAddress - Registers {start}..{end} not found");
        ExceptionCode::IllegalDataAddress
    })
}
