//! # Scenario Runner
//!
//! A scenario is a TOML script: sites, containers and links to set up, then
//! an ordered list of operations against named links. Every step is run
//! even if an earlier one failed; the report records each outcome against
//! its expectation along with the final link, registry and event state.
//!
//! ```toml
//! name = "replicate then purge"
//!
//! [[containers]]
//! id = 1
//! name = "orders"
//!
//! [[links]]
//! name = "order"
//! container = 1
//! key = 7
//! register = true
//!
//! [[steps]]
//! op = "become_replica"
//! link = "order"
//! site = 2
//!
//! [[steps]]
//! op = "delete"
//! link = "order"
//! expect = "error"
//! ```

use crate::config::Config;
use entlink_core::{
    ContainerId, DistributionRole, EntityLink, EntityType, FieldFacet, InMemoryTransactor,
    LifecyclePhase, LinkError, LinkEvent, LinkId, LinkResult, RecordingSink, Residence,
    ScheduledEvent, Services, Shortcut, SinkRef, SiteId, Space, TypeId, TypeRef, Value, ValueKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// SCENARIO FILE
// =============================================================================

/// A key as written in a scenario: integer or text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Int(i64),
    Text(String),
}

impl From<KeySpec> for Value {
    fn from(key: KeySpec) -> Self {
        match key {
            KeySpec::Int(v) => Value::Int(v),
            KeySpec::Text(s) => Value::Text(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteSpec {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub storage: bool,
    #[serde(default)]
    pub persistent: bool,
    /// Identity this container keys its members by.
    pub key_identity: Option<String>,
    /// Link of the entity that owns this container.
    pub meta: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub name: String,
    pub container: Option<u64>,
    pub key: Option<KeySpec>,
    #[serde(default)]
    pub register: bool,
    #[serde(default)]
    pub persistent: bool,
}

/// One scripted operation against a named link.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Migrate {
        link: String,
        site: u32,
    },
    BecomeReplica {
        link: String,
        site: u32,
    },
    BecomeForwarder {
        link: String,
    },
    Register {
        link: String,
    },
    Bind {
        link: String,
        container: u64,
        key: Option<KeySpec>,
    },
    Delete {
        link: String,
    },
    Purge {
        link: String,
    },
    Connect {
        link: String,
        sink: String,
    },
    Disconnect {
        link: String,
        sink: String,
    },
    Forward {
        link: String,
        event: String,
    },
    SetIdentity {
        link: String,
        identity: String,
        value: KeySpec,
    },
    ResolveKey {
        link: String,
    },
    SyncPersistence {
        link: String,
    },
    ContentsChanged {
        link: String,
    },
    Kernel {
        link: String,
        phase: Option<LifecyclePhase>,
        persistent: Option<bool>,
    },
    Clone {
        link: String,
        name: String,
    },
}

impl Operation {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Migrate { .. } => "migrate",
            Self::BecomeReplica { .. } => "become_replica",
            Self::BecomeForwarder { .. } => "become_forwarder",
            Self::Register { .. } => "register",
            Self::Bind { .. } => "bind",
            Self::Delete { .. } => "delete",
            Self::Purge { .. } => "purge",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Forward { .. } => "forward",
            Self::SetIdentity { .. } => "set_identity",
            Self::ResolveKey { .. } => "resolve_key",
            Self::SyncPersistence { .. } => "sync_persistence",
            Self::ContentsChanged { .. } => "contents_changed",
            Self::Kernel { .. } => "kernel",
            Self::Clone { .. } => "clone",
        }
    }

    /// The link the operation targets.
    #[must_use]
    pub fn link(&self) -> &str {
        match self {
            Self::Migrate { link, .. }
            | Self::BecomeReplica { link, .. }
            | Self::BecomeForwarder { link }
            | Self::Register { link }
            | Self::Bind { link, .. }
            | Self::Delete { link }
            | Self::Purge { link }
            | Self::Connect { link, .. }
            | Self::Disconnect { link, .. }
            | Self::Forward { link, .. }
            | Self::SetIdentity { link, .. }
            | Self::ResolveKey { link }
            | Self::SyncPersistence { link }
            | Self::ContentsChanged { link }
            | Self::Kernel { link, .. }
            | Self::Clone { link, .. } => link,
        }
    }
}

/// Whether a step is expected to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    #[default]
    Ok,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default)]
    pub expect: Expectation,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    pub sites: Vec<SiteSpec>,
    pub containers: Vec<ContainerSpec>,
    pub links: Vec<LinkSpec>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn parse(text: &str) -> LinkResult<Self> {
        toml::from_str(text)
            .map_err(|e| LinkError::Serialization(format!("Invalid scenario: {}", e)))
    }
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: &'static str,
    pub link: String,
    pub expected: Expectation,
    pub ok: bool,
    pub detail: String,
}

impl StepOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.ok == (self.expected == Expectation::Ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub name: String,
    pub id: LinkId,
    pub role: DistributionRole,
    pub residence: SiteId,
    pub shortcut: Option<Shortcut>,
    pub registered: bool,
    pub persistent: bool,
    pub key: Option<Value>,
    pub chain: Vec<Option<ContainerId>>,
    pub observers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub local_site: SiteId,
    pub steps: Vec<StepOutcome>,
    pub links: Vec<LinkSummary>,
    pub registry_size: usize,
    pub committed: Vec<ScheduledEvent>,
    pub observed: BTreeMap<String, Vec<LinkEvent>>,
}

impl ScenarioReport {
    /// Steps whose outcome did not match their expectation.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| !s.passed()).count()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scenario: {}", self.name)?;
        writeln!(f, "Local site: {}", self.local_site)?;
        writeln!(f)?;
        writeln!(f, "Steps:")?;
        for step in &self.steps {
            let mark = if step.passed() { "ok  " } else { "FAIL" };
            writeln!(
                f,
                "  [{}] {:>2} {:<17} {:<10} {}",
                mark, step.index, step.op, step.link, step.detail
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Links:")?;
        for link in &self.links {
            let shortcut = link
                .shortcut
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            writeln!(
                f,
                "  {:<10} {:<9} {} shortcut={} registered={} persistent={} chain={}",
                link.name,
                link.role,
                Residence::at(link.residence),
                shortcut,
                link.registered,
                link.persistent,
                link.chain.len()
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Registry size:    {}", self.registry_size)?;
        writeln!(f, "Committed events: {}", self.committed.len())?;
        for (sink, events) in &self.observed {
            writeln!(f, "Sink {}: {} event(s)", sink, events.len())?;
        }
        write!(f, "Failures: {}", self.failures())
    }
}

// =============================================================================
// RUNNER
// =============================================================================

fn item_type() -> TypeRef {
    EntityType::new(TypeId(1), "Item")
        .with_primary(Arc::new(FieldFacet::new("id", ValueKind::Int)))
        .with_facet(Arc::new(FieldFacet::new("code", ValueKind::Text)))
        .into_ref()
}

fn site_type() -> TypeRef {
    EntityType::new(TypeId(0), "Site").as_site().into_ref()
}

fn unknown(what: &str, name: impl fmt::Display) -> LinkError {
    LinkError::Serialization(format!("unknown {} '{}'", what, name))
}

pub struct ScenarioRunner {
    services: Arc<Services>,
    transactor: Arc<InMemoryTransactor>,
    item_type: TypeRef,
    site_type: TypeRef,
    containers: BTreeMap<u64, Arc<Space>>,
    links: BTreeMap<String, Arc<EntityLink>>,
    sinks: BTreeMap<String, Arc<RecordingSink>>,
}

impl ScenarioRunner {
    pub fn new(config: &Config) -> LinkResult<Self> {
        let transactor = Arc::new(InMemoryTransactor::new());
        let services = Arc::new(config.build_services(transactor.clone())?);
        Ok(Self {
            services,
            transactor,
            item_type: item_type(),
            site_type: site_type(),
            containers: BTreeMap::new(),
            links: BTreeMap::new(),
            sinks: BTreeMap::new(),
        })
    }

    /// Set up the scenario and run every step.
    ///
    /// Setup errors abort the run; step errors are recorded in the report.
    pub fn run(mut self, scenario: &Scenario) -> LinkResult<ScenarioReport> {
        self.setup(scenario)?;

        let mut steps = Vec::with_capacity(scenario.steps.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            let result = self.apply(&step.operation);
            let (ok, detail) = match result {
                Ok(detail) => (true, detail),
                Err(e) => (false, e.to_string()),
            };
            let outcome = StepOutcome {
                index,
                op: step.operation.name(),
                link: step.operation.link().to_string(),
                expected: step.expect,
                ok,
                detail,
            };
            if outcome.passed() {
                tracing::debug!(index, op = outcome.op, "step passed");
            } else {
                tracing::warn!(index, op = outcome.op, detail = %outcome.detail, "step failed");
            }
            steps.push(outcome);
        }

        Ok(self.report(scenario, steps))
    }

    fn setup(&mut self, scenario: &Scenario) -> LinkResult<()> {
        for spec in &scenario.containers {
            let mut space = Space::new(ContainerId(spec.id), spec.name.clone());
            if spec.storage {
                space = space.storage(spec.persistent);
            }
            if let Some(identity) = &spec.key_identity {
                space = space.keyed_by(identity.clone());
            }
            self.containers.insert(spec.id, Arc::new(space));
        }

        for site in &scenario.sites {
            let link = EntityLink::new(Arc::clone(&self.services), Arc::clone(&self.site_type));
            link.migrate_residence(Residence::at(SiteId(site.id)))?;
            link.register()?;
            self.links.insert(site.name.clone(), link);
        }

        for spec in &scenario.links {
            let key = spec.key.clone().map(Value::from);
            let link = match spec.container {
                Some(id) => EntityLink::in_container(
                    Arc::clone(&self.services),
                    Arc::clone(&self.item_type),
                    &self.container(id)?,
                    key,
                )?,
                None => {
                    let link =
                        EntityLink::new(Arc::clone(&self.services), Arc::clone(&self.item_type));
                    if let Some(key) = key {
                        link.set_key(key)?;
                        link.synchronize_identity()?;
                    }
                    link
                }
            };
            if spec.persistent {
                link.update_kernel(|k| k.persistent = true);
            }
            if spec.register {
                link.register()?;
            }
            self.links.insert(spec.name.clone(), link);
        }

        for spec in &scenario.containers {
            if let Some(meta) = &spec.meta {
                let owner = self.link(meta)?;
                self.container(spec.id)?.bind_meta(&owner);
            }
        }

        tracing::info!(
            containers = self.containers.len(),
            links = self.links.len(),
            "scenario set up"
        );
        Ok(())
    }

    fn container(&self, id: u64) -> LinkResult<Arc<Space>> {
        self.containers
            .get(&id)
            .cloned()
            .ok_or_else(|| unknown("container", id))
    }

    fn link(&self, name: &str) -> LinkResult<Arc<EntityLink>> {
        self.links
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("link", name))
    }

    fn sink(&mut self, name: &str) -> Arc<RecordingSink> {
        Arc::clone(
            self.sinks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RecordingSink::new(name))),
        )
    }

    fn apply(&mut self, operation: &Operation) -> LinkResult<String> {
        let link = self.link(operation.link())?;
        match operation {
            Operation::Migrate { site, .. } => {
                link.migrate_residence(Residence::at(SiteId(*site)))?;
                Ok(format!("residence {}", link.residence()))
            }
            Operation::BecomeReplica { site, .. } => {
                link.become_replica(Residence::at(SiteId(*site)))?;
                Ok(format!("{} {}", link.role(), link.residence()))
            }
            Operation::BecomeForwarder { .. } => {
                link.become_forwarder();
                Ok(link.role().to_string())
            }
            Operation::Register { .. } => {
                link.register()?;
                Ok(format!("shortcut {:?}", link.shortcut()))
            }
            Operation::Bind { container, key, .. } => {
                let space = self.container(*container)?;
                link.bind_into(&space, key.clone().map(Value::from))?;
                Ok(format!("chain length {}", link.chain().len()))
            }
            Operation::Delete { .. } => {
                let before = self.transactor.committed().len();
                link.delete_in(None)?;
                Ok(format!(
                    "{} deleted event(s)",
                    self.transactor.committed().len() - before
                ))
            }
            Operation::Purge { .. } => {
                link.purge()?;
                Ok("purged".to_string())
            }
            Operation::Connect { sink, .. } => {
                let sink: SinkRef = self.sink(sink);
                link.connect(sink);
                Ok(format!("{} observer(s)", link.observer_count()))
            }
            Operation::Disconnect { sink, .. } => {
                let sink: SinkRef = self.sink(sink);
                link.disconnect(&sink);
                Ok(format!("{} observer(s)", link.observer_count()))
            }
            Operation::Forward { event, .. } => {
                link.forward(&LinkEvent::Custom(event.clone()));
                Ok(format!("delivered to {} observer(s)", link.observer_count()))
            }
            Operation::SetIdentity {
                identity, value, ..
            } => {
                link.set_identity(identity, Some(value.clone().into()))?;
                Ok(format!("chain length {}", link.chain().len()))
            }
            Operation::ResolveKey { .. } => Ok(match link.resolve_key()? {
                Some(key) => format!("key {}", key),
                None => "no key".to_string(),
            }),
            Operation::SyncPersistence { .. } => {
                let changed = link.synchronize_persistence();
                Ok(format!("persistent {} (changed {})", link.kernel().persistent, changed))
            }
            Operation::ContentsChanged { .. } => {
                let before = self.transactor.committed().len();
                link.on_contents_changed()?;
                Ok(format!(
                    "{} event(s) committed",
                    self.transactor.committed().len() - before
                ))
            }
            Operation::Kernel {
                phase, persistent, ..
            } => {
                link.update_kernel(|k| {
                    if let Some(phase) = phase {
                        k.phase = *phase;
                    }
                    if let Some(persistent) = persistent {
                        k.persistent = *persistent;
                    }
                });
                Ok(format!("{:?}", link.kernel()))
            }
            Operation::Clone { name, .. } => {
                let clone = link.clone_link()?;
                let detail = format!("cloned as {}", clone.id());
                self.links.insert(name.clone(), clone);
                Ok(detail)
            }
        }
    }

    fn report(&self, scenario: &Scenario, steps: Vec<StepOutcome>) -> ScenarioReport {
        let links = self
            .links
            .iter()
            .map(|(name, link)| LinkSummary {
                name: name.clone(),
                id: link.id(),
                role: link.role(),
                residence: link.site(),
                shortcut: link.shortcut(),
                registered: link.is_registered(),
                persistent: link.kernel().persistent,
                key: link.key(),
                chain: link.chain().iter().map(|e| e.container_id()).collect(),
                observers: link.observer_count(),
            })
            .collect();

        ScenarioReport {
            name: if scenario.name.is_empty() {
                "unnamed".to_string()
            } else {
                scenario.name.clone()
            },
            local_site: self.services.local_site(),
            steps,
            links,
            registry_size: self.services.registry().len(),
            committed: self.transactor.committed(),
            observed: self
                .sinks
                .iter()
                .map(|(name, sink)| (name.clone(), sink.events()))
                .collect(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> ScenarioReport {
        let scenario = Scenario::parse(text).expect("parse");
        ScenarioRunner::new(&Config::default())
            .expect("runner")
            .run(&scenario)
            .expect("run")
    }

    #[test]
    fn parses_steps_with_expectations() {
        let scenario = Scenario::parse(
            r#"
            [[steps]]
            op = "migrate"
            link = "a"
            site = 2

            [[steps]]
            op = "delete"
            link = "a"
            expect = "error"
            "#,
        )
        .expect("parse");
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(scenario.steps[0].operation.name(), "migrate");
        assert_eq!(scenario.steps[1].expect, Expectation::Error);
    }

    #[test]
    fn unknown_link_is_a_failed_step() {
        let report = run(
            r#"
            [[steps]]
            op = "purge"
            link = "ghost"
            "#,
        );
        assert_eq!(report.failures(), 1);
        assert!(report.steps[0].detail.contains("ghost"));
    }

    #[test]
    fn replica_scenario() {
        let report = run(
            r#"
            name = "replica"

            [[containers]]
            id = 1
            name = "orders"

            [[links]]
            name = "order"
            container = 1
            key = 7
            register = true
            persistent = true

            [[steps]]
            op = "become_replica"
            link = "order"
            site = 2

            [[steps]]
            op = "delete"
            link = "order"
            expect = "error"
            "#,
        );
        assert_eq!(report.failures(), 0);
        let order = &report.links[0];
        assert_eq!(order.role, DistributionRole::Replica);
        assert_eq!(order.residence, SiteId(2));
        assert!(order.shortcut.is_some());
        assert_eq!(report.registry_size, 1);
    }

    #[test]
    fn cascade_and_fan_out() {
        let report = run(
            r#"
            [[containers]]
            id = 1
            name = "a"

            [[containers]]
            id = 2
            name = "b"

            [[links]]
            name = "x"
            container = 1
            key = 1

            [[steps]]
            op = "bind"
            link = "x"
            container = 2
            key = 1

            [[steps]]
            op = "connect"
            link = "x"
            sink = "audit"

            [[steps]]
            op = "forward"
            link = "x"
            event = "touched"

            [[steps]]
            op = "delete"
            link = "x"
            "#,
        );
        assert_eq!(report.failures(), 0);
        assert_eq!(report.committed.len(), 2);
        assert_eq!(
            report.observed.get("audit"),
            Some(&vec![LinkEvent::Custom("touched".to_string())])
        );
    }

    #[test]
    fn sites_register_without_shortcut() {
        let report = run(
            r#"
            [[sites]]
            id = 5
            name = "remote"
            "#,
        );
        let site = &report.links[0];
        assert!(site.registered);
        assert!(site.shortcut.is_none());
        assert_eq!(site.residence, SiteId(5));
        assert!(report.to_string().contains("remote"));
    }
}
