//! Egress proxy pool with penalty-based demotion.
//!
//! Endpoints are never deleted: repeated transport failures quarantine an
//! endpoint for a cool-down, after which it returns with reduced health.
//! All operations are synchronous bookkeeping behind a mutex; no lock is
//! ever held across I/O.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use attestor_core::proxy::ProxySpec;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Starting (and post-success) health score. An endpoint is quarantined
    /// after this many consecutive failures.
    pub default_health: u32,
    /// How long a quarantined endpoint is excluded from checkout.
    pub cooldown: Duration,
}

impl ProxyPoolConfig {
    /// Default starting health.
    pub const DEFAULT_HEALTH: u32 = 3;
    /// Default quarantine cool-down.
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(600);

    fn revival_health(&self) -> u32 {
        (self.default_health / 2).max(1)
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            default_health: Self::DEFAULT_HEALTH,
            cooldown: Self::DEFAULT_COOLDOWN,
        }
    }
}

/// A checked-out endpoint. Held by exactly one job until released.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    /// Stable slot index within the pool.
    pub id: usize,
    /// Connection details.
    pub spec: ProxySpec,
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.spec.label())
    }
}

/// How the holder's use of an endpoint went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// No transport-level fault attributable to the proxy.
    Success,
    /// A transport-level failure through this endpoint.
    Failure,
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Available,
    CheckedOut,
    Quarantined { until: Instant },
}

#[derive(Debug)]
struct Slot {
    spec: ProxySpec,
    health: u32,
    state: SlotState,
    last_used: Option<Instant>,
}

/// Pool of egress endpoints with health state.
pub struct ProxyPool {
    cfg: ProxyPoolConfig,
    slots: Mutex<Vec<Slot>>,
}

impl ProxyPool {
    /// Build a pool over the given endpoint specs.
    pub fn new(cfg: ProxyPoolConfig, specs: Vec<ProxySpec>) -> Self {
        let default_health = cfg.default_health.max(1);
        let slots = specs
            .into_iter()
            .map(|spec| Slot {
                spec,
                health: default_health,
                state: SlotState::Available,
                last_used: None,
            })
            .collect();
        Self {
            cfg: ProxyPoolConfig {
                default_health,
                ..cfg
            },
            slots: Mutex::new(slots),
        }
    }

    /// Check out the best available endpoint: highest health, ties broken
    /// least-recently-used. Returns `None` when everything is checked out
    /// or quarantined. Quarantine expiry is evaluated here.
    pub fn checkout(&self) -> Option<ProxyEndpoint> {
        let now = Instant::now();
        let mut slots = self.lock();

        for slot in slots.iter_mut() {
            if let SlotState::Quarantined { until } = slot.state {
                if until <= now {
                    slot.state = SlotState::Available;
                    slot.health = self.cfg.revival_health();
                }
            }
        }

        let mut best: Option<usize> = None;
        for idx in 0..slots.len() {
            if !matches!(slots[idx].state, SlotState::Available) {
                continue;
            }
            best = Some(match best {
                None => idx,
                Some(cur) => {
                    if better_candidate(&slots[idx], &slots[cur]) {
                        idx
                    } else {
                        cur
                    }
                }
            });
        }

        let idx = best?;
        let slot = &mut slots[idx];
        slot.state = SlotState::CheckedOut;
        slot.last_used = Some(now);
        Some(ProxyEndpoint {
            id: idx,
            spec: slot.spec.clone(),
        })
    }

    /// Return a checked-out endpoint. `Success` restores full health;
    /// `Failure` decrements it, quarantining the endpoint at zero.
    pub fn release(&self, endpoint: &ProxyEndpoint, outcome: ProxyOutcome) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(endpoint.id) else {
            return;
        };
        if !matches!(slot.state, SlotState::CheckedOut) {
            return;
        }

        match outcome {
            ProxyOutcome::Success => {
                slot.health = self.cfg.default_health;
                slot.state = SlotState::Available;
            }
            ProxyOutcome::Failure => {
                slot.health = slot.health.saturating_sub(1);
                if slot.health == 0 {
                    slot.state = SlotState::Quarantined {
                        until: Instant::now() + self.cfg.cooldown,
                    };
                } else {
                    slot.state = SlotState::Available;
                }
            }
        }
    }

    /// Total number of endpoints, regardless of state.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the pool was loaded with no endpoints at all.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of endpoints currently available for checkout (quarantine
    /// expiry is not evaluated here).
    pub fn available_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| matches!(s.state, SlotState::Available))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn better_candidate(a: &Slot, b: &Slot) -> bool {
    if a.health != b.health {
        return a.health > b.health;
    }
    match (a.last_used, b.last_used) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(x), Some(y)) => x < y,
    }
}
