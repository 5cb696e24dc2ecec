use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tasks_submitted_total: AtomicU64,
    tasks_completed_total: AtomicU64,
    tasks_failed_total: AtomicU64,
    tasks_rejected_total: AtomicU64,
    tasks_inflight: AtomicU64,
    containers_created_total: AtomicU64,
    containers_reused_total: AtomicU64,
    containers_evicted_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_submitted(&self) {
        self.tasks_submitted_total.fetch_add(1, Ordering::Relaxed);
        self.tasks_inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed_total.fetch_add(1, Ordering::Relaxed);
        self.tasks_inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed_total.fetch_add(1, Ordering::Relaxed);
        self.tasks_inflight.fetch_sub(1, Ordering::Relaxed);
    }

    // Rejections happen before the task is counted in flight.
    pub fn task_rejected(&self) {
        self.tasks_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn container_created(&self) {
        self.containers_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn container_reused(&self) {
        self.containers_reused_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn container_evicted(&self) {
        self.containers_evicted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE task_submitted_total counter\n",
                "task_submitted_total {}\n",
                "# TYPE task_completed_total counter\n",
                "task_completed_total {}\n",
                "# TYPE task_failed_total counter\n",
                "task_failed_total {}\n",
                "# TYPE task_rejected_total counter\n",
                "task_rejected_total {}\n",
                "# TYPE task_inflight gauge\n",
                "task_inflight {}\n",
                "# TYPE container_created_total counter\n",
                "container_created_total {}\n",
                "# TYPE container_reused_total counter\n",
                "container_reused_total {}\n",
                "# TYPE container_evicted_total counter\n",
                "container_evicted_total {}\n"
            ),
            self.tasks_submitted_total.load(Ordering::Relaxed),
            self.tasks_completed_total.load(Ordering::Relaxed),
            self.tasks_failed_total.load(Ordering::Relaxed),
            self.tasks_rejected_total.load(Ordering::Relaxed),
            self.tasks_inflight.load(Ordering::Relaxed),
            self.containers_created_total.load(Ordering::Relaxed),
            self.containers_reused_total.load(Ordering::Relaxed),
            self.containers_evicted_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_tracks_submit_and_terminal() {
        let metrics = MetricsRegistry::new();
        metrics.task_submitted();
        metrics.task_submitted();
        metrics.task_completed();
        metrics.task_failed();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("task_submitted_total 2"));
        assert!(rendered.contains("task_inflight 0"));
    }
}
