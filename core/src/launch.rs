//! Launch composition for one vehicle.
//!
//! [`LaunchArgs`] are the arguments a vehicle launch accepts. Resolving them
//! yields a [`LaunchPlan`]: the vehicle namespace, the parameters declared in
//! it and the three nodes started inside it (tf publisher, localization and
//! quaternion-to-RPY conversion). All validation happens in
//! [`LaunchArgs::resolve`], so a bad argument stops the launch before any
//! node is started.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EstimatorError;
use crate::node::{ParameterServer, join_names, normalize_namespace};
use crate::process::ProcessModel;

pub const DEFAULT_VEHICLE_TYPE: &str = "hippocampus";
pub const DEFAULT_CAMERA_NAME: &str = "vertical_camera";
pub const DEFAULT_IMAGE_RAW_TOPIC: &str = "image_raw";
pub const DEFAULT_IMAGE_RECT_TOPIC: &str = "image_rect";

pub const TF_PUBLISHER_NODE: &str = "tf_publisher";
pub const LOCALIZATION_NODE: &str = "localization";
pub const QUAT_TO_RPY_NODE: &str = "quat_to_rpy";

fn default_vehicle_type() -> String {
    DEFAULT_VEHICLE_TYPE.to_string()
}
fn default_camera_name() -> String {
    DEFAULT_CAMERA_NAME.to_string()
}
fn default_do_rectify() -> bool {
    true
}
fn default_image_raw_topic() -> String {
    DEFAULT_IMAGE_RAW_TOPIC.to_string()
}
fn default_image_rect_topic() -> String {
    DEFAULT_IMAGE_RECT_TOPIC.to_string()
}
fn default_process_model() -> String {
    ProcessModel::Simple.to_string()
}

/// Arguments of a vehicle launch.
///
/// Usable both as command line arguments and as a serialized launch file.
/// `process_model` is kept as text here and only parsed in
/// [`LaunchArgs::resolve`] so an unknown value is reported as a configuration
/// error.
#[derive(Args, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaunchArgs {
    /// Vehicle name, used as the namespace of every node (required)
    #[arg(long)]
    #[serde(default)]
    pub vehicle_name: Option<String>,
    /// Vehicle type
    #[arg(long, default_value = DEFAULT_VEHICLE_TYPE)]
    #[serde(default = "default_vehicle_type")]
    pub vehicle_type: String,
    /// Camera providing the visual pose measurements
    #[arg(long, default_value = DEFAULT_CAMERA_NAME)]
    #[serde(default = "default_camera_name")]
    pub camera_name: String,
    /// Use the rectified image topic
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    #[serde(default = "default_do_rectify")]
    pub do_rectify: bool,
    /// Raw image topic, relative to the camera
    #[arg(long, default_value = DEFAULT_IMAGE_RAW_TOPIC)]
    #[serde(default = "default_image_raw_topic")]
    pub image_raw_topic: String,
    /// Rectified image topic, relative to the camera
    #[arg(long, default_value = DEFAULT_IMAGE_RECT_TOPIC)]
    #[serde(default = "default_image_rect_topic")]
    pub image_rect_topic: String,
    /// EKF process model: simple or velocities
    #[arg(long, default_value = "simple")]
    #[serde(default = "default_process_model")]
    pub process_model: String,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        LaunchArgs {
            vehicle_name: None,
            vehicle_type: default_vehicle_type(),
            camera_name: default_camera_name(),
            do_rectify: default_do_rectify(),
            image_raw_topic: default_image_raw_topic(),
            image_rect_topic: default_image_rect_topic(),
            process_model: default_process_model(),
        }
    }
}

impl LaunchArgs {
    pub fn for_vehicle(vehicle_name: &str) -> Self {
        LaunchArgs {
            vehicle_name: Some(vehicle_name.to_string()),
            ..Default::default()
        }
    }

    /// Validate the arguments and build the launch plan.
    ///
    /// # Returns
    /// * `Ok(LaunchPlan)` - Namespace, parameters and the three nodes.
    /// * `Err(EstimatorError::Configuration)` - A missing or blank vehicle
    ///   name, one that names no namespace, or an unknown process model.
    pub fn resolve(&self) -> Result<LaunchPlan, EstimatorError> {
        let vehicle_name = self
            .vehicle_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                EstimatorError::Configuration("launch argument 'vehicle_name' is required".to_string())
            })?;
        if vehicle_name.contains(char::is_whitespace) {
            return Err(EstimatorError::Configuration(format!(
                "vehicle_name '{}' cannot be used as a namespace",
                vehicle_name
            )));
        }
        let process_model: ProcessModel = self.process_model.parse()?;
        let namespace = normalize_namespace(vehicle_name);
        if namespace == "/" {
            return Err(EstimatorError::Configuration(format!(
                "vehicle_name '{}' does not name a namespace",
                vehicle_name
            )));
        }
        let image_topic = if self.do_rectify {
            &self.image_rect_topic
        } else {
            &self.image_raw_topic
        };
        let camera_image_topic = format!("{}/{}", self.camera_name, image_topic);

        let mut params = BTreeMap::new();
        params.insert(
            join_names(&namespace, "vehicle_name"),
            Value::from(vehicle_name),
        );
        params.insert(
            join_names(&namespace, "vehicle_type"),
            Value::from(self.vehicle_type.as_str()),
        );

        let nodes = vec![
            NodeSpec::new(TF_PUBLISHER_NODE, "hippocampus_common", "node_tf_publisher")
                .with_arg("vehicle_name", vehicle_name)
                .with_arg("vehicle_type", &self.vehicle_type),
            NodeSpec::new(LOCALIZATION_NODE, "localization", "localization")
                .with_arg("vehicle_name", vehicle_name)
                .with_arg("camera_name", &self.camera_name)
                .with_arg("do_rectify", &self.do_rectify.to_string())
                .with_arg("image_topic", &camera_image_topic)
                .with_arg("process_model", &process_model.to_string()),
            NodeSpec::new(QUAT_TO_RPY_NODE, "hippocampus_common", "inc_quat_to_rpy")
                .with_arg("vehicle_name", vehicle_name),
        ];

        Ok(LaunchPlan {
            vehicle_name: vehicle_name.to_string(),
            vehicle_type: self.vehicle_type.clone(),
            namespace,
            process_model,
            camera_image_topic,
            params,
            nodes,
        })
    }
}

/// A node started by the launch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub package: String,
    pub executable: String,
    /// Private parameters handed to the node (`~name`)
    pub args: BTreeMap<String, String>,
}

impl NodeSpec {
    pub fn new(name: &str, package: &str, executable: &str) -> Self {
        NodeSpec {
            name: name.to_string(),
            package: package.to_string(),
            executable: executable.to_string(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

impl Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.package, self.executable)?;
        for (key, value) in &self.args {
            write!(f, "\n      {}: {}", key, value)?;
        }
        Ok(())
    }
}

/// Fully resolved launch of one vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub vehicle_name: String,
    pub vehicle_type: String,
    pub namespace: String,
    pub process_model: ProcessModel,
    /// Image topic the localization subscribes to, relative to the namespace
    pub camera_image_topic: String,
    /// Fully qualified parameters declared in the namespace
    pub params: BTreeMap<String, Value>,
    pub nodes: Vec<NodeSpec>,
}

impl LaunchPlan {
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Declare the namespace parameters and each node's private arguments.
    pub fn apply(&self, server: &ParameterServer) {
        for (name, value) in &self.params {
            server.set(name, value.clone());
        }
        for node in &self.nodes {
            for (key, value) in &node.args {
                let node_namespace = join_names(&self.namespace, &node.name);
                server.set(&join_names(&node_namespace, key), Value::from(value.as_str()));
            }
        }
    }
}

impl Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch plan for {} ({})", self.vehicle_name, self.vehicle_type)?;
        writeln!(f, "  namespace: {}", self.namespace)?;
        writeln!(f, "  process model: {}", self.process_model)?;
        writeln!(f, "  camera image: {}", self.camera_image_topic)?;
        writeln!(f, "  parameters:")?;
        for (name, value) in &self.params {
            writeln!(f, "    {} = {}", name, value)?;
        }
        write!(f, "  nodes:")?;
        for node in &self.nodes {
            write!(f, "\n    {}", node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        launch: LaunchArgs,
    }

    #[test]
    fn defaults_match_launch_file() {
        let args = TestCli::parse_from(["test", "--vehicle-name", "uuv00"]).launch;
        assert_eq!(args, LaunchArgs::for_vehicle("uuv00"));
        assert_eq!(args.vehicle_type, "hippocampus");
        assert_eq!(args.camera_name, "vertical_camera");
        assert!(args.do_rectify);
        assert_eq!(args.process_model, "simple");
    }

    #[test]
    fn missing_vehicle_name_fails() {
        let err = LaunchArgs::default().resolve().unwrap_err();
        assert!(matches!(err, EstimatorError::Configuration(_)));
        let mut args = LaunchArgs::default();
        args.vehicle_name = Some("  ".to_string());
        assert!(matches!(args.resolve(), Err(EstimatorError::Configuration(_))));
    }

    #[test]
    fn root_vehicle_name_fails() {
        for name in ["/", "//", " / "] {
            let err = LaunchArgs::for_vehicle(name).resolve().unwrap_err();
            assert!(
                matches!(&err, EstimatorError::Configuration(msg) if msg.contains("namespace")),
                "{:?} gave {:?}",
                name,
                err
            );
        }
    }

    #[test]
    fn nested_vehicle_name_keys() {
        let plan = LaunchArgs::for_vehicle("/fleet//uuv04/").resolve().unwrap();
        assert_eq!(plan.namespace, "/fleet/uuv04");
        let keys: Vec<&str> = plan.params.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/fleet/uuv04/vehicle_name", "/fleet/uuv04/vehicle_type"]);
        let server = ParameterServer::new();
        plan.apply(&server);
        assert!(server.names().iter().all(|name| !name.contains("//")));
        assert!(server.has("/fleet/uuv04/localization/process_model"));
    }

    #[test]
    fn unknown_process_model_fails() {
        let mut args = LaunchArgs::for_vehicle("uuv00");
        args.process_model = "constant_jerk".to_string();
        assert!(matches!(args.resolve(), Err(EstimatorError::Configuration(_))));
    }

    #[test]
    fn plan_declares_namespace_params_and_nodes() {
        let plan = LaunchArgs::for_vehicle("uuv00").resolve().unwrap();
        assert_eq!(plan.namespace, "/uuv00");
        assert_eq!(plan.process_model, ProcessModel::Simple);
        assert_eq!(plan.params["/uuv00/vehicle_name"], Value::from("uuv00"));
        assert_eq!(plan.params["/uuv00/vehicle_type"], Value::from("hippocampus"));
        let names: Vec<&str> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec![TF_PUBLISHER_NODE, LOCALIZATION_NODE, QUAT_TO_RPY_NODE]);
        assert_eq!(
            plan.node(TF_PUBLISHER_NODE).unwrap().executable,
            "node_tf_publisher"
        );
        let localization = plan.node(LOCALIZATION_NODE).unwrap();
        assert_eq!(localization.arg("image_topic"), Some("vertical_camera/image_rect"));
        assert_eq!(localization.arg("process_model"), Some("simple"));
    }

    #[test]
    fn raw_topic_without_rectification() {
        let args = TestCli::parse_from([
            "test",
            "--vehicle-name",
            "bluerov",
            "--do-rectify",
            "false",
            "--camera-name",
            "front_camera",
            "--process-model",
            "velocities",
        ])
        .launch;
        let plan = args.resolve().unwrap();
        assert_eq!(plan.camera_image_topic, "front_camera/image_raw");
        assert_eq!(plan.process_model, ProcessModel::Velocities);
    }

    #[test]
    fn apply_declares_parameters() {
        let plan = LaunchArgs::for_vehicle("uuv02").resolve().unwrap();
        let server = ParameterServer::new();
        plan.apply(&server);
        assert_eq!(server.get("/uuv02/vehicle_type"), Some(Value::from("hippocampus")));
        assert_eq!(
            server.get("/uuv02/localization/process_model"),
            Some(Value::from("simple"))
        );
        assert!(server.has("/uuv02/tf_publisher/vehicle_type"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let args: LaunchArgs = serde_json::from_str(r#"{"vehicle_name": "uuv03"}"#).unwrap();
        assert_eq!(args, LaunchArgs::for_vehicle("uuv03"));
    }

    #[test]
    fn display_lists_nodes() {
        let text = LaunchArgs::for_vehicle("uuv00").resolve().unwrap().to_string();
        assert!(text.contains("namespace: /uuv00"));
        assert!(text.contains("inc_quat_to_rpy"));
    }
}
