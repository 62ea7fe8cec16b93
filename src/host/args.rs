//! Argument coercion for the built-in operations.
//!
//! Numbers may arrive as JSON numbers or as numeric strings; both are
//! accepted, anything else is a validation error naming the field.

use serde_json::Value;

use super::Beam;
use crate::error::CommandError;
use crate::wire::Fields;

const CREATE_BEAM_REQUIRED: [&str; 4] = ["p1", "p2", "width", "height"];

/// A point in model coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Point3 {
    /// Creates a point.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        let (dx, dy, dz) = (other.x - self.x, other.y - self.y, other.z - self.z);
        dz.mul_add(dz, dx.mul_add(dx, dy * dy)).sqrt()
    }

    /// The point as an `[x, y, z]` array.
    #[must_use]
    pub const fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Parses an `[x, y, z]` array.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `value` is not a list of three numbers.
    pub fn from_value(value: &Value, field: &str) -> Result<Self, CommandError> {
        let invalid = || {
            CommandError::validation(format!(
                "{field} must be a list of 3 numbers [x, y, z], got {value}"
            ))
        };
        let Some([x, y, z]) = value.as_array().map(Vec::as_slice).and_then(|items| {
            <&[Value; 3]>::try_from(items).ok()
        }) else {
            return Err(invalid());
        };
        let coordinate = |v: &Value| coerce_number(v).ok_or_else(invalid);
        Ok(Self::new(coordinate(x)?, coordinate(y)?, coordinate(z)?))
    }
}

/// Validates `create_beam` arguments.
///
/// # Errors
///
/// Returns a validation error naming the first offending field, or every
/// missing required field at once.
pub fn parse_beam(args: &Fields) -> Result<Beam, CommandError> {
    let missing: Vec<&str> = CREATE_BEAM_REQUIRED
        .into_iter()
        .filter(|key| args.get(*key).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(CommandError::validation(format!(
            "missing required arguments for create_beam: {}",
            missing.join(", ")
        )));
    }

    let p1 = Point3::from_value(&args["p1"], "p1")?;
    let p2 = Point3::from_value(&args["p2"], "p2")?;
    let p3 = match args.get("p3") {
        None | Some(Value::Null) => Point3::new(p1.x, p1.y, p1.z + 1.0),
        Some(value) => Point3::from_value(value, "p3")?,
    };
    let width = positive(&args["width"], "width")?;
    let height = positive(&args["height"], "height")?;

    if p1 == p2 {
        return Err(CommandError::validation(
            "p1 and p2 must differ: a beam needs a non-zero length",
        ));
    }

    let name = match args.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(other) => {
            return Err(CommandError::validation(format!(
                "name must be a string, got {other}"
            )))
        }
    };

    Ok(Beam {
        name,
        width,
        height,
        p1,
        p2,
        p3,
    })
}

/// Reads the `element_id` argument.
///
/// # Errors
///
/// Returns a validation error unless the argument is a non-negative integer
/// or a string holding one.
pub fn element_id(args: &Fields) -> Result<u64, CommandError> {
    match args.get("element_id") {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            CommandError::validation(format!("element_id must be a non-negative integer, got {n}"))
        }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| {
            CommandError::validation(format!("element_id must be a non-negative integer, got {s:?}"))
        }),
        Some(other) => Err(CommandError::validation(format!(
            "element_id must be a non-negative integer, got {other}"
        ))),
        None => Err(CommandError::validation("missing required argument: element_id")),
    }
}

fn positive(value: &Value, field: &str) -> Result<f64, CommandError> {
    match coerce_number(value) {
        Some(n) if n > 0.0 => Ok(n),
        Some(n) => Err(CommandError::validation(format!(
            "{field} must be a positive number, got {n}"
        ))),
        None => Err(CommandError::validation(format!(
            "{field} must be a number, got {value}"
        ))),
    }
}

/// Accepts finite JSON numbers and numeric strings.
fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
