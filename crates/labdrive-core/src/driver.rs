//! Driver base: a transport, an ordered feature map and capability mixins.
//!
//! Drivers own data, not control flow. An instrument is described by the list
//! of features handed to [`DriverBuilder`]; every `get`/`set` on the resulting
//! [`Driver`] validates, encodes, performs exactly one transport transaction
//! and decodes.

use crate::capabilities::Capability;
use crate::error::{InstrError, InstrResult};
use crate::error_recovery::{with_retry, Recoverable, RetryPolicy};
use crate::feature::{Access, Encoding, Feature, FeatureInfo, RegisterBank, Tolerance, Value};
use crate::transport::{ensure_open, Reconnect, RegisterAccess, SharedTransport};
use indexmap::IndexMap;
use tracing::{debug, info, instrument};

/// Names that can never be features.
pub const RESERVED_NAMES: &[&str] = &["interface", "transport", "features"];

/// Collects features and capabilities for a [`Driver`].
pub struct DriverBuilder {
    name: String,
    transport: SharedTransport,
    capabilities: Vec<Capability>,
    features: Vec<Feature>,
    retry: Option<RetryPolicy>,
}

impl DriverBuilder {
    pub fn capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features.extend(features);
        self
    }

    /// Route every transaction through `policy`, re-opening the transport
    /// between attempts.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Installs capability features first, then the declared ones, in order.
    ///
    /// Fails with a *domain* error on duplicate or reserved names.
    pub fn build(self) -> InstrResult<Driver> {
        let mut features = IndexMap::new();
        let mixins = self
            .capabilities
            .iter()
            .map(|c| c.features())
            .collect::<InstrResult<Vec<_>>>()?;
        for feature in mixins.into_iter().flatten().chain(self.features) {
            let name = feature.name().to_string();
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(InstrError::ReservedName(name));
            }
            if features.contains_key(&name) {
                return Err(InstrError::DuplicateFeature(name));
            }
            features.insert(name, feature);
        }
        for feature in features.values() {
            if let Some(guard) = feature.guard() {
                let Some(source) = features.get(guard.source()) else {
                    return Err(InstrError::Configuration(format!(
                        "guard of '{}' reads unknown feature '{}'",
                        feature.name(),
                        guard.source()
                    )));
                };
                source.check_readable()?;
            }
        }
        debug!(
            driver = %self.name,
            features = features.len(),
            capabilities = ?self.capabilities,
            "driver built"
        );
        Ok(Driver {
            name: self.name,
            transport: self.transport,
            capabilities: self.capabilities,
            features,
            retry: self.retry,
        })
    }
}

/// An instrument: one transport plus named features.
pub struct Driver {
    name: String,
    transport: SharedTransport,
    capabilities: Vec<Capability>,
    features: IndexMap<String, Feature>,
    retry: Option<RetryPolicy>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("transport", &self.transport.describe())
            .field("capabilities", &self.capabilities)
            .field("features", &self.features.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Driver {
    pub fn builder(name: impl Into<String>, transport: SharedTransport) -> DriverBuilder {
        DriverBuilder {
            name: name.into(),
            transport,
            capabilities: Vec::new(),
            features: Vec::new(),
            retry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    #[instrument(skip(self), fields(driver = %self.name), err)]
    pub async fn open(&self) -> InstrResult<()> {
        self.transport.open().await?;
        info!(address = %self.transport.describe(), "driver opened");
        Ok(())
    }

    /// Closes the transport. Safe to call more than once.
    pub async fn close(&self) -> InstrResult<()> {
        self.transport.close().await
    }

    /// Feature names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.features.keys().map(String::as_str).collect()
    }

    pub fn describe(&self) -> Vec<FeatureInfo> {
        self.features.values().map(Feature::info).collect()
    }

    /// Verify-after-write tolerance of every readable, writable feature.
    pub fn tolerances(&self) -> IndexMap<String, Tolerance> {
        self.features
            .values()
            .filter(|f| f.access() == Access::ReadWrite)
            .map(|f| (f.name().to_string(), f.tolerance()))
            .collect()
    }

    fn lookup(&self, name: &str) -> InstrResult<&Feature> {
        if RESERVED_NAMES.contains(&name) {
            return Err(InstrError::ReservedName(name.to_string()));
        }
        self.features
            .get(name)
            .ok_or_else(|| InstrError::UnknownFeature(name.to_string()))
    }

    /// Handle for `driver.feature("voltage")?.set(2.0)` style access.
    pub fn feature(&self, name: &str) -> InstrResult<FeatureHandle<'_>> {
        Ok(FeatureHandle {
            driver: self,
            feature: self.lookup(name)?,
        })
    }

    #[instrument(skip(self), fields(driver = %self.name), err)]
    pub async fn get(&self, name: &str) -> InstrResult<Value> {
        let feature = self.lookup(name)?;
        feature.check_readable()?;
        self.check_guard(feature).await?;
        self.read_feature(feature).await
    }

    /// Typed read, e.g. `driver.get_as::<f64>("frequency")`.
    pub async fn get_as<T>(&self, name: &str) -> InstrResult<T>
    where
        T: TryFrom<Value, Error = InstrError>,
    {
        T::try_from(self.get(name).await?)
    }

    #[instrument(skip(self, value), fields(driver = %self.name, value = ?value), err)]
    pub async fn set(&self, name: &str, value: Value) -> InstrResult<()> {
        let feature = self.lookup(name)?;
        self.assign(feature, value).await.map(|_| ())
    }

    /// Writes `value`, reads it back and fails with a *protocol* error when
    /// the readback differs by more than the feature's tolerance.
    #[instrument(skip(self, value), fields(driver = %self.name, value = ?value), err)]
    pub async fn set_checked(&self, name: &str, value: Value) -> InstrResult<()> {
        let feature = self.lookup(name)?;
        if !feature.access().can_read() {
            return Err(InstrError::Direction {
                feature: feature.name().to_string(),
                operation: "verified assignment",
            });
        }
        let written = self.assign(feature, value).await?;
        let readback = self.read_feature(feature).await?;
        if feature.tolerance().accepts(&written, &readback) {
            Ok(())
        } else {
            Err(InstrError::protocol(format!(
                "'{}' verify failed: wrote {}, read back {} (tolerance {})",
                feature.name(),
                written,
                readback,
                feature.tolerance()
            )))
        }
    }

    /// Runs a value-less command feature such as `reset_device`.
    pub async fn invoke(&self, name: &str) -> InstrResult<()> {
        self.set(name, Value::Unit).await
    }

    async fn assign(&self, feature: &Feature, value: Value) -> InstrResult<Value> {
        let value = feature.prepare(value)?;
        self.check_guard(feature).await?;
        self.write_feature(feature, &value).await?;
        if value != Value::Unit {
            feature.remember(value.clone());
        }
        Ok(value)
    }

    async fn check_guard(&self, feature: &Feature) -> InstrResult<()> {
        let Some(guard) = feature.guard() else {
            return Ok(());
        };
        let source = self.lookup(guard.source())?;
        let current = self.read_feature(source).await?;
        if guard.allows(&current) {
            Ok(())
        } else {
            Err(InstrError::state(format!(
                "'{}' requires {}, but {} is {}",
                feature.name(),
                guard.description(),
                guard.source(),
                current
            )))
        }
    }

    async fn read_feature(&self, feature: &Feature) -> InstrResult<Value> {
        let operation = format!("read {}", feature.name());
        self.transact(&operation, move || self.read_once(feature))
            .await
    }

    async fn write_feature(&self, feature: &Feature, value: &Value) -> InstrResult<()> {
        let operation = format!("write {}", feature.name());
        self.transact(&operation, move || self.write_once(feature, value))
            .await
    }

    async fn transact<T, F, Fut>(&self, operation: &str, mut op: F) -> InstrResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = InstrResult<T>>,
    {
        match &self.retry {
            Some(policy) => {
                let reconnect = Reconnect(self.transport.as_ref());
                let hook: &dyn Recoverable = &reconnect;
                with_retry(operation, policy, Some(hook), op).await
            }
            None => op().await,
        }
    }

    async fn read_once(&self, feature: &Feature) -> InstrResult<Value> {
        ensure_open(self.transport.as_ref())?;
        match feature.encoding() {
            Encoding::Text(codec) => {
                let command = codec.query_command(feature.name())?;
                let reply = self.transport.query(&command).await?;
                debug!(
                    feature = feature.name(),
                    reply = %String::from_utf8_lossy(&reply).trim_end(),
                    "query"
                );
                codec.decode(feature.name(), feature.domain(), &reply)
            }
            Encoding::Register(codec) => {
                let registers = self.registers()?;
                let words = match codec.bank {
                    RegisterBank::Holding => {
                        registers
                            .read_holding_registers(codec.address, codec.width.words())
                            .await?
                    }
                    RegisterBank::Input => {
                        registers
                            .read_input_registers(codec.address, codec.width.words())
                            .await?
                    }
                };
                debug!(feature = feature.name(), address = codec.address, ?words, "read registers");
                codec.decode(feature.name(), feature.domain(), &words)
            }
        }
    }

    async fn write_once(&self, feature: &Feature, value: &Value) -> InstrResult<()> {
        ensure_open(self.transport.as_ref())?;
        match feature.encoding() {
            Encoding::Text(codec) => {
                let command = codec.encode_assignment(feature.name(), feature.domain(), value)?;
                debug!(
                    feature = feature.name(),
                    command = %String::from_utf8_lossy(&command),
                    "write"
                );
                self.transport.write(&command).await
            }
            Encoding::Register(codec) => {
                let words = codec.encode(feature.name(), feature.domain(), value)?;
                debug!(feature = feature.name(), address = codec.address, ?words, "write registers");
                self.registers()?.write_registers(codec.address, &words).await
            }
        }
    }

    fn registers(&self) -> InstrResult<&dyn RegisterAccess> {
        self.transport.registers().ok_or_else(|| {
            InstrError::Configuration(format!(
                "transport {} has no register access",
                self.transport.describe()
            ))
        })
    }
}

/// A feature bound to its driver.
#[derive(Clone, Copy)]
pub struct FeatureHandle<'a> {
    driver: &'a Driver,
    feature: &'a Feature,
}

impl<'a> FeatureHandle<'a> {
    pub fn name(&self) -> &'a str {
        self.feature.name()
    }

    pub fn info(&self) -> FeatureInfo {
        self.feature.info()
    }

    /// Last successfully written value.
    pub fn cached(&self) -> Option<Value> {
        self.feature.cached()
    }

    pub async fn get(&self) -> InstrResult<Value> {
        self.driver.get(self.feature.name()).await
    }

    pub async fn set(&self, value: impl Into<Value>) -> InstrResult<()> {
        self.driver.set(self.feature.name(), value.into()).await
    }

    pub async fn set_checked(&self, value: impl Into<Value>) -> InstrResult<()> {
        self.driver
            .set_checked(self.feature.name(), value.into())
            .await
    }

    pub async fn invoke(&self) -> InstrResult<()> {
        self.driver.invoke(self.feature.name()).await
    }
}
