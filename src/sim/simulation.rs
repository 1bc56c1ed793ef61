use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use log::{info, trace};

use crate::base::{Component, ComponentId, Ctx, Delivery, Event, LinkTable, PortId, PortRef};
use crate::sim::stats::{RunSummary, StatSet};
use crate::timeq::{Cycle, EventId, EventQueue};

/// Event-driven kernel: owns the components, the links between them and the global event queue.
/// Events are dispatched one at a time in `(time, insertion)` order.
#[derive(Default)]
pub struct Simulation {
    components: Vec<Box<dyn Component>>,
    links: LinkTable,
    queue: EventQueue<Delivery>,
    events: u64,
    started: bool,
}

impl Simulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C: Component>(&mut self, component: C) -> ComponentId {
        self.components.push(Box::new(component));
        self.components.len() - 1
    }

    /// Id the next `add` will hand out, for components that must know their own id up front.
    pub fn next_id(&self) -> ComponentId {
        self.components.len()
    }

    pub fn connect(
        &mut self,
        a: (ComponentId, PortId),
        b: (ComponentId, PortId),
        latency: Cycle,
    ) -> anyhow::Result<()> {
        for (id, _) in [a, b] {
            anyhow::ensure!(id < self.components.len(), "no component with id {}", id);
        }
        self.links
            .connect(PortRef::new(a.0, a.1), PortRef::new(b.0, b.1), latency)
            .with_context(|| {
                format!(
                    "linking {} to {}",
                    self.components[a.0].name(),
                    self.components[b.0].name()
                )
            })
    }

    pub fn now(&self) -> Cycle {
        self.queue.now()
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Run every component's `setup` once.  Called implicitly by the first `step`.
    pub fn setup(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        for (id, component) in self.components.iter_mut().enumerate() {
            let mut ctx = Ctx::new(id, &mut self.queue, &self.links);
            component
                .setup(&mut ctx)
                .with_context(|| format!("setting up {}", component.name()))?;
        }
        Ok(())
    }

    /// Wake `target` with `Event::Timer(token)` after `delay`.
    pub fn schedule(&mut self, target: ComponentId, delay: Cycle, token: u64) -> EventId {
        self.queue.push_after(
            delay,
            Delivery {
                target,
                event: Event::Timer(token),
            },
        )
    }

    /// Dispatch the next event.  Returns false when nothing is left to do.
    pub fn step(&mut self) -> anyhow::Result<bool> {
        self.setup()?;
        let Some((now, delivery)) = self.queue.pop()? else {
            return Ok(false);
        };
        self.events += 1;
        let component = self
            .components
            .get_mut(delivery.target)
            .ok_or_else(|| anyhow!("event for unknown component {}", delivery.target))?;
        trace!("@{} -> {}: {:?}", now, component.name(), delivery.event);
        let mut ctx = Ctx::new(delivery.target, &mut self.queue, &self.links);
        component
            .handle(delivery.event, &mut ctx)
            .with_context(|| format!("{} at {}ps", component.name(), now))?;
        Ok(true)
    }

    /// Run until the queue drains or simulated time passes `limit` (0 = no limit).
    pub fn run(&mut self, limit: Cycle) -> anyhow::Result<Cycle> {
        info!("simulation start with {} components", self.components.len());
        while let Some(next) = self.queue.peek_time().or_else(|| (!self.started).then_some(0)) {
            if limit > 0 && next > limit {
                info!("stopping at time limit {}ps", limit);
                break;
            }
            if !self.step()? {
                break;
            }
        }
        info!("simulation stop at {}ps after {} events", self.now(), self.events);
        Ok(self.now())
    }

    pub fn is_quiescent(&self) -> bool {
        self.components.iter().all(|c| c.is_quiescent())
    }

    /// Components still holding in-flight work.
    pub fn busy_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| !c.is_quiescent())
            .map(|c| c.name())
            .collect()
    }

    pub fn component<T: Component>(&self, id: ComponentId) -> Option<&T> {
        self.components.get(id)?.as_any().downcast_ref::<T>()
    }

    pub fn component_mut<T: Component>(&mut self, id: ComponentId) -> Option<&mut T> {
        self.components.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn component_stats(&self, id: ComponentId) -> Option<&StatSet> {
        self.components.get(id).map(|c| c.stats())
    }

    pub fn collect_stats(&self) -> RunSummary {
        let mut components = BTreeMap::new();
        for component in &self.components {
            components.insert(component.name().to_string(), component.stats().clone());
        }
        RunSummary {
            end_time_ps: self.now(),
            events: self.events,
            components,
        }
    }
}
