//! In-memory host document and the built-in operation set.
//!
//! The plug-in side of the bridge normally runs inside Cadwork and mutates
//! the open 3D model. This module provides a self-contained stand-in: a
//! [`Model`] holding beam elements, and handlers for every [`Operation`] the
//! plug-in exposes. The model sits behind a mutex, but the accept loop only
//! ever runs one handler at a time, so the lock is never contended.

mod args;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};

use crate::dispatch::{Dispatcher, HandlerResult, Registry};
use crate::error::CommandError;
use crate::wire::Fields;

pub use args::{element_id, parse_beam, Point3};

/// Major version reported for the emulated host application.
pub const HOST_VERSION: &str = "30";

/// Version of the plug-in protocol implementation.
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name reported for a model that was never saved.
const UNSAVED_MODEL_NAME: &str = "(unsaved model)";

/// A rectangular beam defined by its axis and orientation point.
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    /// Optional element name.
    pub name: Option<String>,
    /// Cross-section width.
    pub width: f64,
    /// Cross-section height.
    pub height: f64,
    /// Axis start point.
    pub p1: Point3,
    /// Axis end point.
    pub p2: Point3,
    /// Orientation point fixing the height direction.
    pub p3: Point3,
}

impl Beam {
    /// Axis length.
    #[must_use]
    pub fn length(&self) -> f64 {
        self.p1.distance(self.p2)
    }

    /// The `create_beam` arguments that recreate this beam.
    #[must_use]
    pub fn to_args(&self) -> Fields {
        let mut args = fields(json!({
            "p1": self.p1.to_array(),
            "p2": self.p2.to_array(),
            "p3": self.p3.to_array(),
            "width": self.width,
            "height": self.height,
        }));
        if let Some(name) = &self.name {
            args.insert("name".to_string(), Value::String(name.clone()));
        }
        args
    }

    fn describe(&self, id: u64) -> Fields {
        fields(json!({
            "element_id": id,
            "type": "beam",
            "name": self.name,
            "width": self.width,
            "height": self.height,
            "length": self.length(),
            "p1": self.p1.to_array(),
            "p2": self.p2.to_array(),
            "p3": self.p3.to_array(),
        }))
    }
}

/// The host document.
#[derive(Debug, Default)]
pub struct Model {
    name: Option<String>,
    elements: BTreeMap<u64, Beam>,
    last_id: u64,
}

impl Model {
    /// Creates an empty model with an optional file name.
    #[must_use]
    pub const fn new(name: Option<String>) -> Self {
        Self {
            name,
            elements: BTreeMap::new(),
            last_id: 0,
        }
    }

    /// The model's file name, if saved.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Adds a beam and returns its element id. Ids start at 1.
    pub fn add_beam(&mut self, beam: Beam) -> u64 {
        self.last_id += 1;
        self.elements.insert(self.last_id, beam);
        self.last_id
    }

    /// Looks up a beam by element id.
    #[must_use]
    pub fn beam(&self, id: u64) -> Option<&Beam> {
        self.elements.get(&id)
    }

    /// All element ids in ascending order.
    pub fn element_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.elements.keys().copied()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if the model has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// A model shared between the handlers of one dispatcher.
pub type SharedModel = Arc<Mutex<Model>>;

/// Operations the plug-in understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Liveness check used for the startup handshake.
    Ping,
    /// Host and plug-in version numbers.
    GetVersionInfo,
    /// File name of the open model.
    GetModelName,
    /// Creates a rectangular beam.
    CreateBeam,
    /// Ids of all elements in the model.
    ListElements,
    /// Attributes of one element.
    GetElementInfo,
}

impl Operation {
    /// Every operation, in registration order.
    pub const ALL: [Self; 6] = [
        Self::Ping,
        Self::GetVersionInfo,
        Self::GetModelName,
        Self::CreateBeam,
        Self::ListElements,
        Self::GetElementInfo,
    ];

    /// The wire name of the operation.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::GetVersionInfo => "get_version_info",
            Self::GetModelName => "get_model_name",
            Self::CreateBeam => "create_beam",
            Self::ListElements => "list_elements",
            Self::GetElementInfo => "get_element_info",
        }
    }
}

/// Registers a handler for every [`Operation`] against `model`.
pub fn register_operations(registry: &mut Registry, model: &SharedModel) {
    for operation in Operation::ALL {
        let model = Arc::clone(model);
        match operation {
            Operation::Ping => {
                registry.register(operation.name(), |_: &Fields| -> HandlerResult {
                    Ok(fields(json!({ "message": "pong" })))
                });
            }
            Operation::GetVersionInfo => {
                registry.register(operation.name(), |_: &Fields| -> HandlerResult {
                    Ok(fields(json!({
                        "cw_version": HOST_VERSION,
                        "plugin_version": PLUGIN_VERSION,
                    })))
                });
            }
            Operation::GetModelName => {
                registry.register(operation.name(), move |_: &Fields| -> HandlerResult {
                    let model = lock(&model);
                    Ok(fields(json!({
                        "name": model.name().unwrap_or(UNSAVED_MODEL_NAME),
                    })))
                });
            }
            Operation::CreateBeam => {
                registry.register(operation.name(), move |args: &Fields| -> HandlerResult {
                    let beam = args::parse_beam(args)?;
                    let id = lock(&model).add_beam(beam);
                    tracing::info!(element_id = id, "Beam created");
                    Ok(fields(json!({ "id": id })))
                });
            }
            Operation::ListElements => {
                registry.register(operation.name(), move |_: &Fields| -> HandlerResult {
                    let model = lock(&model);
                    let ids: Vec<u64> = model.element_ids().collect();
                    Ok(fields(json!({ "count": ids.len(), "element_ids": ids })))
                });
            }
            Operation::GetElementInfo => {
                registry.register(operation.name(), move |args: &Fields| -> HandlerResult {
                    let id = args::element_id(args)?;
                    lock(&model)
                        .beam(id)
                        .map(|beam| beam.describe(id))
                        .ok_or_else(|| CommandError::failed(format!("element {id} not found")))
                });
            }
        }
    }
}

/// Builds a dispatcher serving every [`Operation`] against `model`.
#[must_use]
pub fn dispatcher(model: &SharedModel) -> Dispatcher {
    let mut registry = Registry::new();
    register_operations(&mut registry, model);
    Dispatcher::new(registry)
}

fn lock(model: &Mutex<Model>) -> MutexGuard<'_, Model> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}
