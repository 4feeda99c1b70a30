//! Node runtime: parameter server, named nodes and the localization worker.
//!
//! [`ParameterServer`] is a thread-safe, namespaced store of JSON-like
//! parameter values shared by every node of a launch. [`Node`] resolves names
//! against its namespace, reads parameters with logged defaults and blocks in
//! [`Node::run`] until it is shut down.
//!
//! [`LocalizationNode`] runs a [`Localization`] on a dedicated worker thread.
//! The worker is the only owner of the estimate; inputs arrive over a command
//! channel and pose estimates are published on an output channel after each
//! prediction. Publishing never blocks and a vanished subscriber never stops
//! the estimator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::EstimatorConfig;
use crate::error::EstimatorError;
use crate::localization::{Localization, PoseEstimate};
use crate::messages::{Event, TimedMeasurement};
use crate::process::ProcessModel;

/// Default maximum number of characters of a parameter value written to the log.
pub const DEFAULT_LOG_LIMIT: usize = 80 * 5;

/// Shared, namespaced parameter store.
#[derive(Clone, Debug, Default)]
pub struct ParameterServer {
    params: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl ParameterServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        // a panicking writer cannot leave a half-written entry behind
        self.params.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.lock().insert(name.to_string(), value);
    }

    pub fn has(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn delete(&self, name: &str) -> Option<Value> {
        self.lock().remove(name)
    }

    /// All parameter names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

/// Normalize a namespace to `/a/b` form (`/` for the root namespace).
pub fn normalize_namespace(namespace: &str) -> String {
    let parts: Vec<&str> = namespace.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Join a name onto a namespace without doubling the root slash.
pub fn join_names(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Cut a rendered value to `limit` characters followed by `...` (0 disables).
pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if limit > 0 && value.chars().count() > limit {
        let mut cut: String = value.chars().take(limit).collect();
        cut.push_str("...");
        cut
    } else {
        value.to_string()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How parameter access is logged.
#[derive(Clone, Copy, Debug)]
pub struct ParamLogging {
    pub verbose: bool,
    pub limit: usize,
}

impl Default for ParamLogging {
    fn default() -> Self {
        ParamLogging {
            verbose: true,
            limit: DEFAULT_LOG_LIMIT,
        }
    }
}

/// Handle used to stop a [`Node::run`] loop from any thread.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wait(&self) {
        let (flag, condvar) = &*self.inner;
        let mut stopped = flag.lock().unwrap_or_else(|p| p.into_inner());
        while !*stopped {
            stopped = condvar
                .wait(stopped)
                .unwrap_or_else(|p| p.into_inner());
        }
    }
}

/// A named participant of a launch.
#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    namespace: String,
    params: ParameterServer,
    shutdown: ShutdownSignal,
}

impl Node {
    pub fn new(name: &str, namespace: &str, params: ParameterServer) -> Self {
        let node = Node {
            name: name.trim_matches('/').to_string(),
            namespace: normalize_namespace(namespace),
            params,
            shutdown: ShutdownSignal::default(),
        };
        info!("[{}] Initialized.", node.fully_qualified_name());
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn params(&self) -> &ParameterServer {
        &self.params
    }

    pub fn fully_qualified_name(&self) -> String {
        join_names(&self.namespace, &self.name)
    }

    /// Resolve `/absolute`, `~private` and relative names.
    pub fn resolve(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else if let Some(private) = name.strip_prefix('~') {
            join_names(&self.fully_qualified_name(), private.trim_start_matches('/'))
        } else {
            join_names(&self.namespace, name)
        }
    }

    /// Read a parameter, falling back to `default`.
    ///
    /// A missing parameter is logged as a warning and, when a default is given,
    /// the default is written back to the server so later readers agree.
    ///
    /// # Arguments
    /// * `name` - Private (`~`), relative or absolute parameter name.
    /// * `default` - Value used and stored when the parameter is missing.
    ///
    /// # Returns
    /// * The stored value, or the default when the parameter is missing or
    ///   does not deserialize as `T`.
    pub fn get_param<T>(&self, name: &str, default: Option<T>) -> Option<T>
    where
        T: DeserializeOwned + Serialize,
    {
        self.get_param_with(name, default, ParamLogging::default())
    }

    pub fn get_param_with<T>(&self, name: &str, default: Option<T>, logging: ParamLogging) -> Option<T>
    where
        T: DeserializeOwned + Serialize,
    {
        let me = self.fully_qualified_name();
        let key = self.resolve(name);
        match self.params.get(&key) {
            Some(value) => match serde_json::from_value::<T>(value.clone()) {
                Ok(param) => {
                    if logging.verbose {
                        info!(
                            "[{}] {}={}",
                            me,
                            name,
                            truncate_for_log(&render(&value), logging.limit)
                        );
                    }
                    Some(param)
                }
                Err(err) => {
                    warn!(
                        "[{}] Parameter '{}' has an unexpected type ({}). Using the default.",
                        me, name, err
                    );
                    default
                }
            },
            None => {
                match &default {
                    None => warn!(
                        "[{}] No default value given for parameter '{}', unexpected behaviour possible.",
                        me, name
                    ),
                    Some(value) => match serde_json::to_value(value) {
                        Ok(json) => {
                            warn!(
                                "[{}] Parameter '{}' does not exist. Using default value '{}'.",
                                me,
                                name,
                                truncate_for_log(&render(&json), logging.limit)
                            );
                            self.params.set(&key, json);
                        }
                        Err(err) => warn!(
                            "[{}] Parameter '{}' does not exist and its default cannot be stored: {}",
                            me, name, err
                        ),
                    },
                }
                default
            }
        }
    }

    /// Write a parameter and log the (truncated) value.
    pub fn set_param<T: Serialize>(&self, name: &str, value: T) -> Result<(), EstimatorError> {
        self.set_param_with(name, value, ParamLogging::default())
    }

    pub fn set_param_with<T: Serialize>(
        &self,
        name: &str,
        value: T,
        logging: ParamLogging,
    ) -> Result<(), EstimatorError> {
        let json = serde_json::to_value(value).map_err(|e| {
            EstimatorError::InvalidInput(format!("parameter '{}' is not serializable: {}", name, e))
        })?;
        if logging.verbose {
            info!(
                "[{}] {}={}",
                self.fully_qualified_name(),
                name,
                truncate_for_log(&render(&json), logging.limit)
            );
        }
        self.params.set(&self.resolve(name), json);
        Ok(())
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Block until the node is shut down.
    pub fn run(&self) {
        self.shutdown.wait();
        info!("[{}] Shutting down...", self.fully_qualified_name());
    }
}

/// Requests handled by the localization worker.
#[derive(Debug)]
pub enum Command {
    Measurement(TimedMeasurement),
    Predict(f64),
    Reset(Sender<Result<(), EstimatorError>>),
    Reconfigure(EstimatorConfig, Sender<Result<(), EstimatorError>>),
    ResetWith(EstimatorConfig, Sender<Result<(), EstimatorError>>),
    Shutdown,
}

/// A [`Localization`] running on its own thread.
#[derive(Debug)]
pub struct LocalizationNode {
    node: Node,
    commands: Sender<Command>,
    worker: Option<JoinHandle<Localization>>,
    running: Arc<AtomicBool>,
}

impl LocalizationNode {
    /// Start the worker and return the node with its pose output.
    ///
    /// The vehicle name comes from the `vehicle_name` parameter of the node's
    /// namespace and is required. The private `~process_model` parameter
    /// overrides the configured model; an unknown value fails fast.
    ///
    /// # Arguments
    /// * `node` - Node whose namespace and parameters configure the worker.
    /// * `config` - Estimator configuration before parameter overrides.
    ///
    /// # Returns
    /// * The running node and the receiver of its published estimates.
    pub fn spawn(
        node: Node,
        mut config: EstimatorConfig,
    ) -> Result<(LocalizationNode, Receiver<PoseEstimate>), EstimatorError> {
        let vehicle_name: String = node
            .get_param("vehicle_name", None)
            .filter(|name: &String| !name.trim().is_empty())
            .ok_or_else(|| {
                EstimatorError::Configuration(format!(
                    "parameter '{}' is required",
                    node.resolve("vehicle_name")
                ))
            })?;
        let model: String = node
            .get_param("~process_model", Some(config.process_model.to_string()))
            .unwrap_or_else(|| config.process_model.to_string());
        config.process_model = model.parse::<ProcessModel>()?;

        let localization = Localization::new(&vehicle_name, config)?;
        let (command_tx, command_rx) = mpsc::channel();
        let (pose_tx, pose_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let shutdown = node.shutdown_signal();
        let worker = thread::Builder::new()
            .name(format!("localization-{}", vehicle_name))
            .spawn(move || {
                let localization = worker_loop(localization, command_rx, pose_tx);
                worker_running.store(false, Ordering::SeqCst);
                shutdown.trigger();
                localization
            })
            .map_err(EstimatorError::from)?;

        Ok((
            LocalizationNode {
                node,
                commands: command_tx,
                worker: Some(worker),
                running,
            },
            pose_rx,
        ))
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> Result<(), EstimatorError> {
        self.commands
            .send(command)
            .map_err(|_| EstimatorError::Disconnected("localization worker stopped".to_string()))
    }

    fn request(
        &self,
        make: impl FnOnce(Sender<Result<(), EstimatorError>>) -> Command,
    ) -> Result<(), EstimatorError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(make(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| EstimatorError::Disconnected("localization worker stopped".to_string()))?
    }

    /// Hand a measurement to the worker. Stale measurements are logged by the worker.
    pub fn submit(&self, measurement: TimedMeasurement) -> Result<(), EstimatorError> {
        self.send(Command::Measurement(measurement))
    }

    /// Ask the worker to advance to `stamp_s` and publish the result.
    pub fn predict(&self, stamp_s: f64) -> Result<(), EstimatorError> {
        self.send(Command::Predict(stamp_s))
    }

    pub fn reset(&self) -> Result<(), EstimatorError> {
        self.request(Command::Reset)
    }

    pub fn reconfigure(&self, config: EstimatorConfig) -> Result<(), EstimatorError> {
        self.request(|reply| Command::Reconfigure(config, reply))
    }

    pub fn reset_with(&self, config: EstimatorConfig) -> Result<(), EstimatorError> {
        self.request(|reply| Command::ResetWith(config, reply))
    }

    /// Block until the worker stops (see [`Node::run`]).
    pub fn spin(&self) {
        self.node.run();
    }

    /// Stop the worker and hand back the final estimator.
    pub fn shutdown(mut self) -> Result<Localization, EstimatorError> {
        // the worker may already be gone, joining below reports the outcome
        let _ = self.commands.send(Command::Shutdown);
        let worker = self
            .worker
            .take()
            .ok_or_else(|| EstimatorError::Disconnected("worker already joined".to_string()))?;
        worker
            .join()
            .map_err(|_| EstimatorError::Disconnected("localization worker panicked".to_string()))
    }
}

impl Drop for LocalizationNode {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(Command::Shutdown);
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    mut localization: Localization,
    commands: Receiver<Command>,
    poses: Sender<PoseEstimate>,
) -> Localization {
    let name = localization.vehicle_name().to_string();
    for command in commands {
        match command {
            Command::Measurement(measurement) => {
                // stale measurements are already logged by the estimator
                let _ = localization.handle(Event::Measurement(measurement));
            }
            Command::Predict(stamp_s) => match localization.handle(Event::Predict { stamp_s }) {
                Ok(summary) => {
                    if !summary.skipped.is_empty() {
                        debug!(
                            "[{}] {} measurement(s) skipped at t={:.3}",
                            name,
                            summary.skipped.len(),
                            stamp_s
                        );
                    }
                    if poses.send(localization.estimate()).is_err() {
                        debug!("[{}] No pose subscriber, estimate not published", name);
                    }
                }
                Err(err) => warn!("[{}] Prediction to t={:.3} failed: {}", name, stamp_s, err),
            },
            Command::Reset(reply) => {
                let _ = reply.send(localization.reset());
            }
            Command::Reconfigure(config, reply) => {
                let _ = reply.send(localization.reconfigure(config));
            }
            Command::ResetWith(config, reply) => {
                let _ = reply.send(localization.reset_with(config));
            }
            Command::Shutdown => break,
        }
    }
    info!("[{}] Localization worker stopped", name);
    localization
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::PositionMeasurement;
    use nalgebra::Vector3;
    use serde_json::json;

    fn vehicle_params(name: &str) -> ParameterServer {
        let params = ParameterServer::new();
        params.set(&format!("/{}/vehicle_name", name), json!(name));
        params
    }

    #[test]
    fn namespace_normalization() {
        assert_eq!(normalize_namespace(""), "/");
        assert_eq!(normalize_namespace("uuv00"), "/uuv00");
        assert_eq!(normalize_namespace("//uuv00/sub/"), "/uuv00/sub");
    }

    #[test]
    fn name_resolution() {
        let node = Node::new("localization", "uuv00", ParameterServer::new());
        assert_eq!(node.fully_qualified_name(), "/uuv00/localization");
        assert_eq!(node.resolve("/global"), "/global");
        assert_eq!(node.resolve("~rate"), "/uuv00/localization/rate");
        assert_eq!(node.resolve("vehicle_name"), "/uuv00/vehicle_name");
        let root = Node::new("tf", "/", ParameterServer::new());
        assert_eq!(root.resolve("x"), "/x");
        assert_eq!(root.resolve("~x"), "/tf/x");
    }

    #[test]
    fn get_param_writes_back_default() {
        let params = ParameterServer::new();
        let node = Node::new("localization", "uuv00", params.clone());
        let rate: Option<f64> = node.get_param("~rate", Some(50.0));
        assert_eq!(rate, Some(50.0));
        assert_eq!(params.get("/uuv00/localization/rate"), Some(json!(50.0)));
        let missing: Option<String> = node.get_param("~frame", None);
        assert!(missing.is_none());
        assert!(!params.has("/uuv00/localization/frame"));
    }

    #[test]
    fn get_param_reads_existing_and_type_mismatch() {
        let params = ParameterServer::new();
        params.set("/uuv00/vehicle_type", json!("hippocampus"));
        let node = Node::new("localization", "uuv00", params);
        let vehicle_type: Option<String> = node.get_param("vehicle_type", None);
        assert_eq!(vehicle_type.as_deref(), Some("hippocampus"));
        let wrong: Option<f64> = node.get_param("vehicle_type", Some(1.0));
        assert_eq!(wrong, Some(1.0));
    }

    #[test]
    fn set_param_round_trip() {
        let node = Node::new("localization", "uuv00", ParameterServer::new());
        node.set_param("~topics", vec!["a", "b"]).unwrap();
        let topics: Option<Vec<String>> = node.get_param("~topics", None);
        assert_eq!(topics, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(node.params().names(), vec!["/uuv00/localization/topics"]);
    }

    #[test]
    fn truncation() {
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
        assert_eq!(truncate_for_log("abc", 3), "abc");
        assert_eq!(truncate_for_log("abcdef", 0), "abcdef");
    }

    #[test]
    fn run_returns_after_shutdown() {
        let node = Node::new("tf_publisher", "uuv00", ParameterServer::new());
        let signal = node.shutdown_signal();
        let handle = thread::spawn(move || node.run());
        signal.trigger();
        handle.join().unwrap();
        assert!(signal.is_triggered());
    }

    #[test]
    fn spin_returns_when_node_is_stopped() {
        let node = Node::new("localization", "uuv00", vehicle_params("uuv00"));
        let (loc_node, poses) = LocalizationNode::spawn(node, EstimatorConfig::default()).unwrap();
        let signal = loc_node.node().shutdown_signal();
        thread::scope(|s| {
            let spinner = s.spawn(|| loc_node.spin());
            signal.trigger();
            spinner.join().unwrap();
        });
        // stopping the spin loop leaves the worker serving commands
        assert!(loc_node.is_running());
        loc_node.predict(0.5).unwrap();
        assert_eq!(poses.recv().unwrap().stamp_s, 0.5);
        let localization = loc_node.shutdown().unwrap();
        assert_eq!(localization.last_applied_s(), Some(0.5));
    }

    #[test]
    fn localization_node_requires_vehicle_name() {
        let node = Node::new("localization", "uuv00", ParameterServer::new());
        let err = LocalizationNode::spawn(node, EstimatorConfig::default()).unwrap_err();
        assert!(matches!(err, EstimatorError::Configuration(_)));
    }

    #[test]
    fn localization_node_rejects_unknown_process_model() {
        let params = vehicle_params("uuv00");
        params.set("/uuv00/localization/process_model", json!("constant_jerk"));
        let node = Node::new("localization", "uuv00", params);
        let err = LocalizationNode::spawn(node, EstimatorConfig::default()).unwrap_err();
        assert!(matches!(err, EstimatorError::Configuration(_)));
    }

    #[test]
    fn localization_node_publishes_estimates() {
        let params = vehicle_params("uuv00");
        params.set("/uuv00/localization/process_model", json!("velocities"));
        let node = Node::new("localization", "uuv00", params);
        let (loc_node, poses) = LocalizationNode::spawn(node, EstimatorConfig::default()).unwrap();
        assert!(loc_node.is_running());
        loc_node
            .submit(TimedMeasurement::new(
                0.0,
                PositionMeasurement {
                    position: Vector3::new(1.0, 0.0, 0.0),
                    noise_std: 0.01,
                },
            ))
            .unwrap();
        loc_node.predict(0.1).unwrap();
        let estimate = poses.recv().unwrap();
        assert_eq!(estimate.stamp_s, 0.1);
        assert!(estimate.position.x > 0.9);
        assert!(estimate.twist.is_some());

        let err = loc_node
            .reconfigure(EstimatorConfig::default())
            .unwrap_err();
        assert!(matches!(err, EstimatorError::IncompatibleModel(_)));
        loc_node.reset_with(EstimatorConfig::default()).unwrap();
        loc_node.reset().unwrap();

        let localization = loc_node.shutdown().unwrap();
        assert_eq!(localization.config().process_model, ProcessModel::Simple);
        assert_eq!(localization.vehicle_name(), "uuv00");
    }

    #[test]
    fn dropped_subscriber_does_not_stop_worker() {
        let node = Node::new("localization", "uuv00", vehicle_params("uuv00"));
        let (loc_node, poses) = LocalizationNode::spawn(node, EstimatorConfig::default()).unwrap();
        drop(poses);
        loc_node.predict(1.0).unwrap();
        loc_node.predict(2.0).unwrap();
        loc_node.reset().unwrap();
        let localization = loc_node.shutdown().unwrap();
        assert_eq!(localization.last_applied_s(), None);
    }
}
