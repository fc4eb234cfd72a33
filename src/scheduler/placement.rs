use std::cmp::Ordering;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, StoreError};
use crate::model::{Resources, VmRequest, Worker};
use crate::store::ResourceStore;

/// Weighted-sum placement over a zone's workers.
///
/// Every call works on its own copy of the worker set: `filter` returns a
/// fresh vector and `place_all` takes it by value, so nothing leaks between
/// scheduling passes.
#[derive(Debug, Clone)]
pub struct PlacementScheduler {
    config: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct PlacementScore {
    pub worker_id: i64,
    pub score: f64,
    pub ram_score: f64,
    pub disk_score: f64,
    pub vcpu_score: f64,
}

/// Node → worker pairing produced by one scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub node: String,
    pub worker_id: i64,
    pub coefficient: f64,
}

impl PlacementScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Converts a request into the inventory's units.
    pub fn requirement(&self, request: &VmRequest) -> Resources {
        request
            .demand
            .to_inventory(self.config.ram_unit_bytes, self.config.disk_unit_bytes)
    }

    /// Workers of `zone` with capacity and headroom scaled by the overcommit
    /// factor. Reads the store, never writes it.
    pub async fn filter(
        &self,
        store: &dyn ResourceStore,
        zone: &str,
    ) -> Result<Vec<Worker>, StoreError> {
        let factor = self.config.overcommit_factor;
        let workers: Vec<Worker> = store
            .workers_in_zone(zone)
            .await?
            .into_iter()
            .filter(|worker| worker.zone == zone)
            .map(|mut worker| {
                worker.capacity = worker.capacity.scaled(factor);
                worker.headroom = worker.headroom.scaled(factor);
                worker
            })
            .collect();

        debug!(zone, factor, count = workers.len(), "Filtered workers");
        Ok(workers)
    }

    pub fn coefficient(&self, worker: &Worker, request: &VmRequest) -> f64 {
        self.calculate_placement_score(worker, request).score
    }

    // The vcpu term is required/available while ram and disk are
    // available/total, so scarce-vcpu workers score higher on it.
    fn calculate_placement_score(&self, worker: &Worker, request: &VmRequest) -> PlacementScore {
        let capacity = &worker.capacity;
        let headroom = &worker.headroom;

        if capacity.ram == 0.0 || capacity.disk == 0.0 || headroom.vcpu == 0.0 {
            return PlacementScore {
                worker_id: worker.id,
                score: 0.0,
                ram_score: 0.0,
                disk_score: 0.0,
                vcpu_score: 0.0,
            };
        }

        let ram_score = self.config.ram_weight * (headroom.ram / capacity.ram);
        let disk_score = self.config.disk_weight * (headroom.disk / capacity.disk);
        let vcpu_score = self.config.vcpu_weight * (f64::from(request.demand.vcpu) / headroom.vcpu);

        PlacementScore {
            worker_id: worker.id,
            score: ram_score + disk_score + vcpu_score,
            ram_score,
            disk_score,
            vcpu_score,
        }
    }

    /// Scores sorted by coefficient descending, ties broken by worker id.
    pub fn rank(&self, workers: &[Worker], request: &VmRequest) -> Vec<PlacementScore> {
        let mut scores: Vec<PlacementScore> = workers
            .iter()
            .map(|worker| self.calculate_placement_score(worker, request))
            .collect();

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.worker_id.cmp(&b.worker_id))
        });
        scores
    }

    /// First-fit over the ranked list for each request in order. The first
    /// request nobody can host aborts the whole pass.
    pub fn place_all(
        &self,
        mut workers: Vec<Worker>,
        requests: &[VmRequest],
    ) -> Result<Vec<Assignment>, SchedulerError> {
        let mut assignments = Vec::with_capacity(requests.len());

        for request in requests {
            let need = self.requirement(request);
            let ranked = self.rank(&workers, request);

            let chosen = ranked.iter().find_map(|score| {
                workers
                    .iter()
                    .position(|w| w.id == score.worker_id && w.headroom.covers(&need))
                    .map(|index| (index, score.score))
            });

            let Some((index, coefficient)) = chosen else {
                warn!(node = %request.node, "No worker satisfies the request");
                return Err(SchedulerError::Infeasible {
                    node: request.node.clone(),
                });
            };

            let worker = &mut workers[index];
            worker.headroom = worker.headroom.saturating_sub(need);
            info!(
                node = %request.node,
                worker = worker.id,
                coefficient,
                "Assigned node to worker"
            );
            assignments.push(Assignment {
                node: request.node.clone(),
                worker_id: worker.id,
                coefficient,
            });
        }

        Ok(assignments)
    }
}
