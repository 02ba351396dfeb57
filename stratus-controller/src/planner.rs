//! Migration planner
//!
//! Turns a snapshot of hosts and VMs into `(vm, destination)` proposals.
//! Stateful across cycles: per-VM and per-host cooldowns live in memory.
//! They are soft constraints; the migration store's single-active-per-VM
//! rule is the hard safety gate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use stratus_common::{HostSnapshot, VmSnapshot};

use crate::config::{PolicyConfig, SchedulerConfig};
use crate::policy;

/// Rolling window for the per-host emergency migration cap
const EMERGENCY_WINDOW: Duration = Duration::from_secs(3600);

/// A proposed migration
#[derive(Debug, Clone)]
pub struct Proposal {
    pub vm: VmSnapshot,
    pub source_host: String,
    pub target_host: String,
    pub reason: String,
}

pub struct Planner {
    scheduler: SchedulerConfig,
    policy: PolicyConfig,
    vm_cooldowns: HashMap<String, Instant>,
    host_cooldowns: HashMap<String, Instant>,
    emergency_history: HashMap<String, Vec<Instant>>,
}

impl Planner {
    pub fn new(scheduler: SchedulerConfig, policy: PolicyConfig) -> Self {
        Self {
            scheduler,
            policy,
            vm_cooldowns: HashMap::new(),
            host_cooldowns: HashMap::new(),
            emergency_history: HashMap::new(),
        }
    }

    fn in_vm_cooldown(&self, vm: &VmSnapshot) -> bool {
        self.vm_cooldowns
            .get(&vm.vm_uuid)
            .map(|t| *t > Instant::now())
            .unwrap_or(false)
    }

    fn set_vm_cooldown(&mut self, vm: &VmSnapshot) {
        self.vm_cooldowns.insert(
            vm.vm_uuid.clone(),
            Instant::now() + Duration::from_secs(self.scheduler.migration_cooldown_secs),
        );
    }

    fn in_host_cooldown(&self, host_id: &str) -> bool {
        self.host_cooldowns
            .get(host_id)
            .map(|t| *t > Instant::now())
            .unwrap_or(false)
    }

    fn set_host_cooldown(&mut self, host_id: &str) {
        self.host_cooldowns.insert(
            host_id.to_string(),
            Instant::now() + Duration::from_secs(self.scheduler.host_cooldown_secs),
        );
    }

    fn emergency_count(&mut self, host_id: &str) -> u32 {
        let cutoff = Instant::now().checked_sub(EMERGENCY_WINDOW);
        let history = self.emergency_history.entry(host_id.to_string()).or_default();
        if let Some(cutoff) = cutoff {
            history.retain(|t| *t > cutoff);
        }
        history.len() as u32
    }

    fn record_emergency(&mut self, host_id: &str) {
        self.emergency_history
            .entry(host_id.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// Periodic rebalance: drain the worst-overloaded hosts first, heaviest
    /// VMs first, simulating each accepted move so later picks see the
    /// post-move cluster.
    pub fn plan_rebalance(
        &mut self,
        hosts: &[HostSnapshot],
        vms_by_host: &HashMap<String, Vec<VmSnapshot>>,
    ) -> Vec<Proposal> {
        let mut working: Vec<HostSnapshot> = hosts.to_vec();
        let mut plan = Vec::new();
        let mut rng = rand::thread_rng();

        let mut overloaded: Vec<(String, f64)> = working
            .iter()
            .filter(|h| policy::is_overloaded(h, &self.policy) && !self.in_host_cooldown(&h.host_id))
            .map(|h| (h.host_id.clone(), h.cpu_percent))
            .collect();
        overloaded.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (src_id, _) in overloaded {
            let Some(vms) = vms_by_host.get(&src_id) else {
                continue;
            };

            let mut candidates: Vec<&VmSnapshot> = vms
                .iter()
                .filter(|vm| !vm.protected && !self.in_vm_cooldown(vm))
                .collect();
            candidates.sort_by(|a, b| {
                b.cpu_percent
                    .unwrap_or(0.0)
                    .partial_cmp(&a.cpu_percent.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for vm in candidates {
                let vm_cpu = vm.cpu_percent.unwrap_or(0.0);
                let target = policy::select_destination(&working, vm_cpu, &src_id, &self.policy, &mut rng)
                    .map(|h| h.host_id.clone());

                if let Some(target) = target {
                    plan.push(Proposal {
                        vm: (*vm).clone(),
                        source_host: src_id.clone(),
                        target_host: target.clone(),
                        reason: "periodic_rebalance".to_string(),
                    });
                    self.set_vm_cooldown(vm);
                    self.set_host_cooldown(&src_id);

                    // simulate the move so the next pick sees post-move load
                    if let Some(src) = working.iter_mut().find(|h| h.host_id == src_id) {
                        src.cpu_percent = (src.cpu_percent - vm_cpu).max(0.0);
                    }
                    if let Some(dst) = working.iter_mut().find(|h| h.host_id == target) {
                        dst.cpu_percent += vm_cpu;
                    }
                }

                if plan.len() >= self.scheduler.max_plan {
                    return plan;
                }
            }
        }

        plan
    }

    /// Emergency plan for one alerting host: move the heaviest movable VM
    /// once, if anywhere admits it. Returns at most one proposal.
    pub fn plan_emergency(
        &mut self,
        alert_host: &HostSnapshot,
        hosts: &[HostSnapshot],
        host_vms: &[VmSnapshot],
    ) -> Vec<Proposal> {
        let host_id = alert_host.host_id.clone();
        if self.in_host_cooldown(&host_id) {
            tracing::debug!("Host {} in cooldown, skipping emergency plan", host_id);
            return Vec::new();
        }
        if self.emergency_count(&host_id) >= self.scheduler.max_emergency_migrations_per_host {
            tracing::info!("Emergency migration cap reached for host {}", host_id);
            return Vec::new();
        }

        let mut candidates: Vec<&VmSnapshot> = host_vms
            .iter()
            .filter(|vm| !vm.protected && !self.in_vm_cooldown(vm))
            .collect();
        candidates.sort_by(|a, b| {
            b.cpu_percent
                .unwrap_or(0.0)
                .partial_cmp(&a.cpu_percent.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut rng = rand::thread_rng();
        for vm in candidates.into_iter().take(3) {
            let vm_cpu = vm.cpu_percent.unwrap_or(0.0);
            let target = policy::select_destination(hosts, vm_cpu, &host_id, &self.policy, &mut rng)
                .map(|h| h.host_id.clone());

            if let Some(target) = target {
                self.set_vm_cooldown(vm);
                self.set_host_cooldown(&host_id);
                self.record_emergency(&host_id);
                return vec![Proposal {
                    vm: vm.clone(),
                    source_host: host_id,
                    target_host: target,
                    reason: "emergency".to_string(),
                }];
            }
        }

        Vec::new()
    }
}
