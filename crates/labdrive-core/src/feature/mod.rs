//! Feature model: typed, validated, named remote attributes.
//!
//! A [`Feature`] is pure data. It knows its logical [`Domain`], its wire
//! [`Encoding`] and its validators, but it never touches a transport; all I/O
//! is routed through the owning [`Driver`](crate::driver::Driver). This keeps
//! three axes independent:
//!
//! - logical type ([`Domain`], [`Value`])
//! - wire encoding ([`TextCodec`] templates or [`RegisterCodec`] layouts)
//! - transport (whatever the driver was built with)
//!
//! Features are declared with [`Feature::text`] or [`Feature::register`]:
//!
//! ```rust
//! use labdrive_core::feature::{Domain, Feature};
//!
//! let voltage = Feature::text("voltage")
//!     .doc("Output amplitude in volts peak-to-peak")
//!     .query("VOLT?")
//!     .assign("VOLT {value:.4}")
//!     .domain(Domain::float(0.01, 10.0))
//!     .build()
//!     .unwrap();
//! assert!(voltage.access().can_write());
//! ```

mod domain;
mod encoding;
mod value;

pub use domain::{Domain, EnumMap, Tolerance, Validator};
pub use encoding::{
    compose_i32, split_i32, Encoding, FormatSpec, RegisterBank, RegisterCodec, RegisterWidth,
    Template, TextCodec,
};
pub use value::Value;

use crate::error::{InstrError, InstrResult};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Direction of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn can_read(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// Precondition evaluated before any I/O of a feature.
///
/// The guard reads `source` (another feature of the same driver) and passes
/// the decoded value to its predicate. A false predicate fails the access with
/// a *state* error. The source feature is read without evaluating its own
/// guard.
#[derive(Clone)]
pub struct Guard {
    source: String,
    description: String,
    predicate: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl Guard {
    pub fn new(
        source: impl Into<String>,
        description: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: source.into(),
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Allows access only while `source` reads back as the enum label `mode`.
    pub fn mode(source: impl Into<String>, mode: impl Into<String>) -> Self {
        let mode = mode.into();
        let source = source.into();
        let description = format!("{} == {}", source, mode);
        Self::new(source, description, move |v| v.as_str() == Some(mode.as_str()))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn allows(&self, current: &Value) -> bool {
        (self.predicate)(current)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("source", &self.source)
            .field("description", &self.description)
            .finish()
    }
}

/// Serialisable description of a feature, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureInfo {
    pub name: String,
    pub doc: String,
    pub access: Access,
    pub domain: Domain,
    pub encoding: Encoding,
    pub tolerance: Tolerance,
    pub guard: Option<String>,
}

/// A named remote attribute bound to one driver.
#[derive(Debug)]
pub struct Feature {
    name: String,
    doc: String,
    access: Access,
    domain: Domain,
    encoding: Encoding,
    validators: Vec<Validator>,
    guard: Option<Guard>,
    tolerance: Tolerance,
    cache: Mutex<Option<Value>>,
}

impl Feature {
    /// Starts a message-based feature (command templates).
    pub fn text(name: impl Into<String>) -> FeatureBuilder {
        FeatureBuilder::new(name.into(), Family::Text)
    }

    /// Starts a holding-register feature at `address`.
    pub fn register(name: impl Into<String>, address: u16) -> FeatureBuilder {
        FeatureBuilder::new(name.into(), Family::Register(address))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn guard(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    /// Last value successfully written, if any.
    pub fn cached(&self) -> Option<Value> {
        self.cache.lock().clone()
    }

    pub(crate) fn remember(&self, value: Value) {
        *self.cache.lock() = Some(value);
    }

    pub fn info(&self) -> FeatureInfo {
        FeatureInfo {
            name: self.name.clone(),
            doc: self.doc.clone(),
            access: self.access,
            domain: self.domain.clone(),
            encoding: self.encoding.clone(),
            tolerance: self.tolerance,
            guard: self.guard.as_ref().map(|g| g.description.clone()),
        }
    }

    /// Fails when the feature cannot be read.
    pub fn check_readable(&self) -> InstrResult<()> {
        if self.access.can_read() {
            Ok(())
        } else {
            Err(InstrError::Direction {
                feature: self.name.clone(),
                operation: "reading",
            })
        }
    }

    /// Validates an assignment without performing I/O and returns the
    /// canonical value to encode.
    pub fn prepare(&self, value: Value) -> InstrResult<Value> {
        if !self.access.can_write() {
            return Err(InstrError::Direction {
                feature: self.name.clone(),
                operation: "assignment",
            });
        }
        let value = self.domain.check(&self.name, value)?;
        for validator in &self.validators {
            validator.validate(&self.name, &value)?;
        }
        if let Encoding::Register(codec) = &self.encoding {
            // Register range is a property of the value alone.
            codec.encode(&self.name, &self.domain, &value)?;
        }
        Ok(value)
    }
}

enum Family {
    Text,
    Register(u16),
}

/// Declarative builder for [`Feature`].
///
/// Template and layout errors are reported by [`FeatureBuilder::build`] as
/// *configuration* errors.
pub struct FeatureBuilder {
    name: String,
    family: Family,
    doc: String,
    access: Option<Access>,
    domain: Domain,
    query: Option<String>,
    assign: Option<String>,
    reply: Option<String>,
    words: Option<(String, String)>,
    width: RegisterWidth,
    signed: bool,
    decimals: u32,
    bank: RegisterBank,
    validators: Vec<Validator>,
    guard: Option<Guard>,
    tolerance: Option<Tolerance>,
}

impl FeatureBuilder {
    fn new(name: String, family: Family) -> Self {
        let domain = match family {
            Family::Text => Domain::any_float(),
            Family::Register(_) => Domain::unsigned(16),
        };
        Self {
            name,
            family,
            doc: String::new(),
            access: None,
            domain,
            query: None,
            assign: None,
            reply: None,
            words: None,
            width: RegisterWidth::One,
            signed: false,
            decimals: 0,
            bank: RegisterBank::Holding,
            validators: Vec::new(),
            guard: None,
            tolerance: None,
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.access = Some(Access::ReadOnly);
        self
    }

    pub fn write_only(mut self) -> Self {
        self.access = Some(Access::WriteOnly);
        self
    }

    /// Query command, e.g. `"FREQ?"`.
    pub fn query(mut self, template: impl Into<String>) -> Self {
        self.query = Some(template.into());
        self
    }

    /// Assignment template, e.g. `"FREQ {value}"`.
    pub fn assign(mut self, template: impl Into<String>) -> Self {
        self.assign = Some(template.into());
        self
    }

    /// Regex applied to replies; the first capture group is decoded.
    pub fn reply(mut self, pattern: impl Into<String>) -> Self {
        self.reply = Some(pattern.into());
        self
    }

    /// Wire words for booleans (default `ON`/`OFF`).
    pub fn bool_words(mut self, on: impl Into<String>, off: impl Into<String>) -> Self {
        self.words = Some((on.into(), off.into()));
        self
    }

    /// Value-less command such as `*RST`.
    pub fn action(mut self, command: impl Into<String>) -> Self {
        self.domain = Domain::Action;
        self.assign = Some(command.into());
        self.access = Some(Access::WriteOnly);
        self
    }

    pub fn width(mut self, width: RegisterWidth) -> Self {
        self.width = width;
        self
    }

    pub fn signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    pub fn decimals(mut self, decimals: u32) -> Self {
        self.decimals = decimals;
        self
    }

    /// Reads from the input-register table (function 0x04); implies read-only.
    pub fn input_register(mut self) -> Self {
        self.bank = RegisterBank::Input;
        self.access = Some(Access::ReadOnly);
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn range(self, min: f64, max: f64) -> Self {
        self.validator(Validator::Range { min, max })
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Only valid while `source` reads back as `mode`.
    pub fn gated_on(self, source: impl Into<String>, mode: impl Into<String>) -> Self {
        self.guard(Guard::mode(source, mode))
    }

    pub fn tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn build(self) -> InstrResult<Feature> {
        let name = self.name;
        let config_err = |reason: String| {
            InstrError::Configuration(format!("feature '{}': {}", name, reason))
        };
        if name.trim().is_empty() {
            return Err(InstrError::Configuration("feature name is empty".into()));
        }

        let (encoding, access) = match self.family {
            Family::Text => {
                let access = self.access.unwrap_or(match (&self.query, &self.assign) {
                    (Some(_), Some(_)) => Access::ReadWrite,
                    (Some(_), None) => Access::ReadOnly,
                    _ => Access::WriteOnly,
                });
                if access.can_read() && self.query.is_none() {
                    return Err(config_err("readable feature needs a query command".into()));
                }
                if access.can_write() && self.assign.is_none() {
                    return Err(config_err("writable feature needs an assignment template".into()));
                }
                let assign = self.assign.as_deref().map(Template::parse).transpose()?;
                if let Some(template) = &assign {
                    let needs_value = !matches!(self.domain, Domain::Action);
                    if needs_value != template.has_placeholder() {
                        return Err(config_err(format!(
                            "assignment template '{}' {} a {{value}} placeholder",
                            template.as_str(),
                            if needs_value { "lacks" } else { "must not contain" }
                        )));
                    }
                }
                let query = self.query.as_deref().map(Template::parse).transpose()?;
                let reply = self
                    .reply
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| config_err(format!("bad reply pattern: {}", e)))?;
                let mut codec = TextCodec {
                    query,
                    assign,
                    reply,
                    ..TextCodec::default()
                };
                if let Some((on, off)) = self.words {
                    codec.true_word = on;
                    codec.false_word = off;
                }
                (Encoding::Text(codec), access)
            }
            Family::Register(address) => {
                let access = self.access.unwrap_or(Access::ReadWrite);
                if self.bank == RegisterBank::Input && access.can_write() {
                    return Err(config_err("input registers are read-only".into()));
                }
                match &self.domain {
                    Domain::Bool | Domain::Int { .. } | Domain::Enum { .. } if self.decimals > 0 => {
                        return Err(config_err("decimals need a float domain".into()));
                    }
                    Domain::Action | Domain::Text { .. } | Domain::Bytes { .. } => {
                        return Err(config_err(format!(
                            "{} values cannot live in registers",
                            self.domain.shape_name()
                        )));
                    }
                    _ => {}
                }
                let codec = RegisterCodec {
                    address,
                    width: self.width,
                    signed: self.signed,
                    decimals: self.decimals,
                    bank: self.bank,
                };
                (Encoding::Register(codec), access)
            }
        };

        let tolerance = self
            .tolerance
            .unwrap_or_else(|| self.domain.default_tolerance());

        Ok(Feature {
            name,
            doc: self.doc,
            access,
            domain: self.domain,
            encoding,
            validators: self.validators,
            guard: self.guard,
            tolerance,
            cache: Mutex::new(None),
        })
    }
}
