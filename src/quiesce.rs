//! The quiescence probe: an external observer that decides when the
//! simulated database has gone quiet.
//!
//! The probe polls a master telemetry endpoint over the simulated network
//! for six scalars and reports quiet only after two consecutive passing
//! polls one virtual second apart. Transient failures (an attribute not yet
//! published, a request timing out) reset the consecutive counter without
//! failing the probe. A watchdog keeps pathological seeds from looping
//! forever: after 300 virtual seconds it disables connection failures and
//! lets the probe continue under the easier regime.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::rc::Rc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::QuietGates;
use crate::error::{SimError, SimResult};
use crate::net::{SimNetworkProvider, SimTcpStream};
use crate::sim::world::SimWorld;
use crate::types::NetworkAddress;

const ATTR_DATA_IN_FLIGHT: &str = "DataInFlight";
const ATTR_MAX_TLOG_QUEUE: &str = "MaxTLogQueue";
const ATTR_DD_QUEUE: &str = "DataDistributionQueue";
const ATTR_MAX_STORAGE_QUEUE: &str = "MaxStorageQueue";
const ATTR_DD_ACTIVE: &str = "DataDistributionActive";
const ATTR_RECRUITING: &str = "StorageServersRecruiting";

/// The six scalars the probe gates on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterTelemetry {
    /// Bytes in flight between storage servers.
    pub data_in_flight: i64,
    /// Largest transaction log queue.
    pub max_tlog_queue: i64,
    /// Data-distribution queue depth.
    pub data_distribution_queue: i64,
    /// Largest storage server queue.
    pub max_storage_queue: i64,
    /// Whether data distribution is up and tracking.
    pub data_distribution_active: bool,
    /// Whether storage servers are being recruited.
    pub storage_servers_recruiting: bool,
}

impl ClusterTelemetry {
    /// Telemetry of an idle, healthy cluster.
    pub fn idle() -> Self {
        Self {
            data_distribution_active: true,
            ..Self::default()
        }
    }

    fn passes(&self, gates: &QuietGates) -> bool {
        self.data_in_flight <= gates.max_data_in_flight
            && self.max_tlog_queue <= gates.max_tlog_queue
            && self.data_distribution_queue <= gates.max_data_distribution_queue
            && self.max_storage_queue <= gates.max_storage_queue
            && self.data_distribution_active
            && !self.storage_servers_recruiting
    }
}

/// Wait until the cluster behind `master` reports quiet.
///
/// Requires two consecutive passing polls spaced one virtual second apart
/// (after a pass the next poll waits two seconds; after a fail, one).
pub async fn wait_for_quiet_database(
    world: &SimWorld,
    net: &SimNetworkProvider,
    master: NetworkAddress,
    gates: &QuietGates,
) -> SimResult<()> {
    info!(%master, "quiet database wait begin");
    // Let workers settle into their final placement first.
    world.sleep(gates.settle_delay).await?;

    let mut successes = 0u32;
    loop {
        match poll_telemetry(world, net, master).await {
            Ok(sample) => {
                debug!(?sample, successes, "quiet database poll");
                if sample.passes(gates) {
                    successes += 1;
                    if successes == 2 {
                        info!(now = world.now(), "quiet database done");
                        return Ok(());
                    }
                    world.sleep(2.0).await?;
                } else {
                    successes = 0;
                    world.sleep(1.0).await?;
                }
            }
            Err(e @ (SimError::AttributeNotFound | SimError::TimedOut)) => {
                debug!(%e, "quiet database poll retry");
                successes = 0;
                world.sleep(1.0).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`wait_for_quiet_database`] under a watchdog: if the probe has not
/// succeeded after `gates.watchdog` virtual seconds, connection failures
/// are disabled and the wait continues under the easier regime.
pub async fn quiet_database_with_watchdog(
    world: &SimWorld,
    net: &SimNetworkProvider,
    master: NetworkAddress,
    gates: &QuietGates,
) -> SimResult<()> {
    let fired = {
        tokio::select! {
            biased;
            result = wait_for_quiet_database(world, net, master, gates) => {
                return result;
            }
            result = world.sleep(gates.watchdog) => {
                result?;
                true
            }
        }
    };
    if fired {
        error!(
            watchdog = gates.watchdog,
            "quiet database watchdog fired; disabling connection failures"
        );
        world.set_speed_up_simulation(true);
        world.set_connection_failures(false);
    }
    wait_for_quiet_database(world, net, master, gates).await
}

/// One poll cycle: fetch all six scalars over a fresh connection, each
/// under a one-virtual-second request window.
async fn poll_telemetry(
    world: &SimWorld,
    net: &SimNetworkProvider,
    master: NetworkAddress,
) -> SimResult<ClusterTelemetry> {
    let stream = timeout(world, 1.0, net.connect(master)).await?;
    let mut reader = BufReader::new(stream);
    let sample = fetch_all(world, &mut reader).await;
    // Always say goodbye, even after a failed fetch, so the server moves on
    // to its next connection.
    let _ = reader.get_mut().write_all(b"quit\n").await;
    sample
}

async fn fetch_all(
    world: &SimWorld,
    reader: &mut BufReader<SimTcpStream>,
) -> SimResult<ClusterTelemetry> {
    let data_in_flight = timeout(world, 1.0, fetch_i64(reader, ATTR_DATA_IN_FLIGHT)).await?;
    let max_tlog_queue = timeout(world, 1.0, fetch_i64(reader, ATTR_MAX_TLOG_QUEUE)).await?;
    let data_distribution_queue = timeout(world, 1.0, fetch_i64(reader, ATTR_DD_QUEUE)).await?;
    let max_storage_queue = timeout(world, 1.0, fetch_i64(reader, ATTR_MAX_STORAGE_QUEUE)).await?;
    let dd_state = timeout(world, 1.0, fetch_attribute(reader, ATTR_DD_ACTIVE)).await?;
    let recruiting_state = timeout(world, 1.0, fetch_attribute(reader, ATTR_RECRUITING)).await?;

    Ok(ClusterTelemetry {
        data_in_flight,
        max_tlog_queue,
        data_distribution_queue,
        max_storage_queue,
        data_distribution_active: dd_state == "Active",
        storage_servers_recruiting: recruiting_state == "Recruiting",
    })
}

/// Race `future` against `seconds` of virtual time.
pub async fn timeout<T>(
    world: &SimWorld,
    seconds: f64,
    future: impl Future<Output = SimResult<T>>,
) -> SimResult<T> {
    tokio::select! {
        biased;
        result = future => result,
        result = world.sleep(seconds) => {
            result?;
            Err(SimError::TimedOut)
        }
    }
}

async fn fetch_attribute(
    reader: &mut BufReader<SimTcpStream>,
    attribute: &str,
) -> SimResult<String> {
    let request = format!("get {attribute}\n");
    reader
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .map_err(|_| SimError::ConnectionFailed)?;
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|_| SimError::ConnectionFailed)?;
    if n == 0 {
        return Err(SimError::ConnectionFailed);
    }
    match line.trim_end().strip_prefix("ok ") {
        Some(value) => Ok(value.to_string()),
        None => Err(SimError::AttributeNotFound),
    }
}

async fn fetch_i64(reader: &mut BufReader<SimTcpStream>, attribute: &str) -> SimResult<i64> {
    let value = fetch_attribute(reader, attribute).await?;
    value.parse().map_err(|_| SimError::AttributeNotFound)
}

/// Serves the telemetry protocol for a simulated master worker.
///
/// One line-oriented request per attribute (`get <name>`), answered with
/// `ok <value>` or `err not_found`; `quit` ends the connection. Tests point
/// the probe at one of these to stand in for a whole cluster.
pub struct TelemetryServer {
    telemetry: Rc<RefCell<ClusterTelemetry>>,
    withheld: RefCell<HashSet<String>>,
}

impl TelemetryServer {
    /// Serve the given (shared, live) telemetry.
    pub fn new(telemetry: Rc<RefCell<ClusterTelemetry>>) -> Self {
        Self {
            telemetry,
            withheld: RefCell::new(HashSet::new()),
        }
    }

    /// Withhold an attribute: requests for it answer `err not_found` until
    /// [`TelemetryServer::publish`] is called.
    pub fn withhold(&self, attribute: &str) {
        self.withheld.borrow_mut().insert(attribute.to_string());
    }

    /// Publish a previously withheld attribute.
    pub fn publish(&self, attribute: &str) {
        self.withheld.borrow_mut().remove(attribute);
    }

    /// Accept and serve probe connections on `addr` until `shutdown` fires.
    pub async fn serve(
        &self,
        net: &SimNetworkProvider,
        addr: NetworkAddress,
        shutdown: CancellationToken,
    ) -> SimResult<()> {
        let world = net.sim().upgrade()?;
        let listener = net.listen(addr)?;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    trace!(%peer, "telemetry connection");
                    if let Err(e) = self.serve_connection(&world, stream, &shutdown).await {
                        debug!(%e, "telemetry connection ended");
                    }
                }
            }
        }
    }

    async fn serve_connection(
        &self,
        world: &SimWorld,
        stream: SimTcpStream,
        shutdown: &CancellationToken,
    ) -> SimResult<()> {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            // An abandoned connection never delivers another byte; time out
            // rather than starving the accept loop forever.
            let n = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                n = reader.read_line(&mut line) => n.map_err(|_| SimError::ConnectionFailed)?,
                result = world.sleep(60.0) => {
                    result?;
                    return Err(SimError::TimedOut);
                }
            };
            if n == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            if line == "quit" {
                return Ok(());
            }
            let response = match line.strip_prefix("get ") {
                Some(attribute) => self.answer(attribute),
                None => "err not_found".to_string(),
            };
            reader
                .get_mut()
                .write_all(format!("{response}\n").as_bytes())
                .await
                .map_err(|_| SimError::ConnectionFailed)?;
        }
    }

    fn answer(&self, attribute: &str) -> String {
        if self.withheld.borrow().contains(attribute) {
            return "err not_found".to_string();
        }
        let telemetry = self.telemetry.borrow();
        match attribute {
            ATTR_DATA_IN_FLIGHT => format!("ok {}", telemetry.data_in_flight),
            ATTR_MAX_TLOG_QUEUE => format!("ok {}", telemetry.max_tlog_queue),
            ATTR_DD_QUEUE => format!("ok {}", telemetry.data_distribution_queue),
            ATTR_MAX_STORAGE_QUEUE => format!("ok {}", telemetry.max_storage_queue),
            ATTR_DD_ACTIVE => {
                if telemetry.data_distribution_active {
                    "ok Active".to_string()
                } else {
                    "ok Inactive".to_string()
                }
            }
            ATTR_RECRUITING => {
                if telemetry.storage_servers_recruiting {
                    "ok Recruiting".to_string()
                } else {
                    "ok Idle".to_string()
                }
            }
            _ => "err not_found".to_string(),
        }
    }
}
