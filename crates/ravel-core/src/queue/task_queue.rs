//! The core task queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, timeout_at, Instant};

use crate::domain::{QosClass, QueueId, Task};
use crate::error::QueueError;
use crate::observability::QueueCounts;
use crate::pool::{default_pool, WorkerPool};

use super::runtime::{self, Mode, QueueCore};

/// A priority-ordered task queue with a concurrency cap.
///
/// Tasks enter through [`add`], sorted by priority (see the sort rules on
/// the queue module). [`start`] activates the queue; a scheduling loop then
/// drains the waiting list, keeping at most `max_simultaneous` tasks in
/// flight, driving each through prepare, configure, and execute.
/// Dependent tasks have their dependencies started inline, in the
/// dependent's own lifecycle; for cross-queue dependencies use
/// [`LinkedTaskQueue`].
///
/// ```no_run
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use ravel_core::domain::{Priority, QosClass, Task, TaskMeta};
/// use ravel_core::queue::TaskQueue;
///
/// struct Upload {
///     meta: TaskMeta,
/// }
///
/// #[async_trait]
/// impl Task for Upload {
///     fn meta(&self) -> &TaskMeta {
///         &self.meta
///     }
///
///     async fn execute(&self) -> bool {
///         // do the work
///         true
///     }
/// }
///
/// # async fn demo() {
/// let queue = TaskQueue::new("uploads", 2);
/// let upload = Upload {
///     meta: TaskMeta::new(QosClass::Utility, Priority::HIGH),
/// };
/// queue.add(Arc::new(upload)).await;
/// queue.start().await;
/// queue.wait().await;
/// # }
/// ```
///
/// [`add`]: TaskQueue::add
/// [`start`]: TaskQueue::start
/// [`LinkedTaskQueue`]: super::LinkedTaskQueue
pub struct TaskQueue {
    pub(crate) core: Arc<QueueCore>,
}

impl TaskQueue {
    /// A local queue on the default worker pool.
    pub fn new(name: impl Into<String>, max_simultaneous: usize) -> Self {
        Self::with_pool(name, max_simultaneous, default_pool())
    }

    /// A local queue dispatching onto the supplied pool.
    pub fn with_pool(
        name: impl Into<String>,
        max_simultaneous: usize,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        Self {
            core: QueueCore::new(name.into(), max_simultaneous, pool, Mode::Local),
        }
    }

    /// A local queue pre-loaded with tasks.
    pub async fn with_tasks(
        name: impl Into<String>,
        max_simultaneous: usize,
        tasks: Vec<Arc<dyn Task>>,
    ) -> Self {
        let queue = Self::new(name, max_simultaneous);
        queue.add_all(tasks).await;
        queue
    }

    pub(crate) fn from_core(core: Arc<QueueCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn id(&self) -> QueueId {
        self.core.id
    }

    pub fn max_simultaneous(&self) -> usize {
        self.core.max_simultaneous
    }

    /// Whether the queue is currently drawing tasks.
    pub async fn is_active(&self) -> bool {
        runtime::is_active(&self.core).await
    }

    // ---- intake -------------------------------------------------------

    /// Insert a task into the waiting list. Idempotent on the task id;
    /// returns whether the task was actually inserted.
    pub async fn add(&self, task: Arc<dyn Task>) -> bool {
        runtime::add_task(&self.core, task).await
    }

    /// Insert several tasks; returns how many were new.
    pub async fn add_all(&self, tasks: impl IntoIterator<Item = Arc<dyn Task>>) -> usize {
        let mut added = 0;
        for task in tasks {
            if self.add(task).await {
                added += 1;
            }
        }
        added
    }

    // ---- control ------------------------------------------------------

    /// Activate the queue and begin draining. No-op when already active.
    pub async fn start(&self) {
        runtime::start(&self.core).await;
    }

    /// Suspend the queue: no new draws; executing pausable tasks are asked
    /// to pause. Non-pausable tasks run to completion.
    pub async fn pause(&self) {
        runtime::pause(&self.core).await;
    }

    /// Reactivate the queue and ask paused tasks to resume.
    pub async fn resume(&self) {
        runtime::resume(&self.core).await;
    }

    /// Ask executing cancellable tasks to cancel; non-cancellable running
    /// tasks are abandoned (they land in `cancelled` on natural exit).
    /// Returns the tasks that cancelled. With `deactivate`, the queue also
    /// stops drawing until the next [`start`].
    ///
    /// [`start`]: TaskQueue::start
    pub async fn cancel(&self, deactivate: bool) -> Vec<Arc<dyn Task>> {
        runtime::cancel(&self.core, deactivate).await
    }

    // ---- rendezvous ---------------------------------------------------

    /// Block until every currently tracked task has completed.
    pub async fn wait(&self) {
        runtime::wait_all(&self.core).await;
    }

    /// Like [`wait`], bounded by a duration.
    ///
    /// [`wait`]: TaskQueue::wait
    pub async fn wait_timeout(&self, limit: Duration) -> Result<(), QueueError> {
        timeout(limit, self.wait())
            .await
            .map_err(|_| QueueError::WaitTimeout {
                queue: self.core.name.clone(),
            })
    }

    /// Like [`wait`], bounded by a deadline.
    ///
    /// [`wait`]: TaskQueue::wait
    pub async fn wait_until(&self, deadline: Instant) -> Result<(), QueueError> {
        timeout_at(deadline, self.wait())
            .await
            .map_err(|_| QueueError::WaitTimeout {
                queue: self.core.name.clone(),
            })
    }

    /// Schedule `work` on the queue's own pool once every currently
    /// tracked task has completed.
    pub async fn notify<F>(&self, qos: QosClass, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = Arc::clone(&self.core.pool);
        self.notify_on(&pool, qos, work).await;
    }

    /// Schedule `work` on the supplied pool once every currently tracked
    /// task has completed.
    pub async fn notify_on<F>(&self, pool: &Arc<dyn WorkerPool>, qos: QosClass, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handles = runtime::tracked_handles(&self.core).await;
        pool.spawn(
            qos,
            Box::pin(async move {
                for handle in handles {
                    handle.wait().await;
                }
                work.await;
            }),
        );
    }

    // ---- views --------------------------------------------------------

    /// Tasks still in the waiting list, in pick order.
    pub async fn waiting(&self) -> Vec<Arc<dyn Task>> {
        runtime::waiting_tasks(&self.core).await
    }

    /// Tasks in flight: started, not terminal, not paused, not parked on
    /// dependencies. Abandoned tasks stay here until their natural exit.
    pub async fn running(&self) -> Vec<Arc<dyn Task>> {
        runtime::tasks_where(&self.core, |s| {
            s.is_started()
                && !s.is_terminal()
                && !s.is_paused()
                && !s.is_waiting()
                && !s.has_waited()
        })
        .await
    }

    pub async fn paused(&self) -> Vec<Arc<dyn Task>> {
        runtime::tasks_where(&self.core, |s| s.is_paused()).await
    }

    pub async fn succeeded(&self) -> Vec<Arc<dyn Task>> {
        runtime::tasks_where(&self.core, |s| s.did_succeed()).await
    }

    pub async fn failed(&self) -> Vec<Arc<dyn Task>> {
        runtime::tasks_where(&self.core, |s| s.did_fail()).await
    }

    pub async fn cancelled(&self) -> Vec<Arc<dyn Task>> {
        runtime::tasks_where(&self.core, |s| s.was_cancelled()).await
    }

    /// Tasks the queue still owes work to: waiting plus in flight.
    pub async fn remaining(&self) -> usize {
        runtime::remaining(&self.core).await
    }

    pub async fn is_done(&self) -> bool {
        self.remaining().await == 0
    }

    /// Consistent snapshot of the per-state counts.
    pub async fn counts(&self) -> QueueCounts {
        runtime::counts(&self.core).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Cancellable, Configurable, Dependent, FailureReason, Pausable, Phase, Priority, Task,
        TaskId, TaskMeta,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;

    type Log = Arc<StdMutex<Vec<String>>>;

    fn new_log() -> Log {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Poll until `cond` holds, or fail the test.
    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    /// Records its name on execute, then succeeds or fails.
    struct Step {
        meta: TaskMeta,
        name: &'static str,
        succeed: bool,
        log: Log,
        executed: AtomicBool,
    }

    impl Step {
        fn new(name: &'static str, priority: Priority, succeed: bool, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::new(QosClass::Default, priority),
                name,
                succeed,
                log: Arc::clone(log),
                executed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Task for Step {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            self.executed.store(true, Ordering::SeqCst);
            push(&self.log, self.name);
            self.succeed
        }

        fn finish(&self) {
            push(&self.log, format!("finish:{}", self.name));
        }
    }

    /// Dependent task recording the order its dependencies complete in.
    struct Chain {
        meta: TaskMeta,
        name: &'static str,
        deps: Vec<Arc<dyn Task>>,
        log: Log,
        dep_order: StdMutex<Vec<TaskId>>,
        executed: AtomicBool,
    }

    impl Chain {
        fn new(name: &'static str, deps: Vec<Arc<dyn Task>>, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::default(),
                name,
                deps,
                log: Arc::clone(log),
                dep_order: StdMutex::new(Vec::new()),
                executed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Task for Chain {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            self.executed.store(true, Ordering::SeqCst);
            push(&self.log, self.name);
            true
        }

        fn as_dependent(&self) -> Option<&dyn Dependent> {
            Some(self)
        }
    }

    impl Dependent for Chain {
        fn dependencies(&self) -> Vec<Arc<dyn Task>> {
            self.deps.clone()
        }

        fn dependency_finished(&self, dep: &dyn Task) {
            self.dep_order.lock().unwrap().push(dep.id());
        }
    }

    /// Pausable task that spin-waits for a release flag.
    struct Spinner {
        meta: TaskMeta,
        released: AtomicBool,
    }

    impl Spinner {
        fn new() -> Arc<Self> {
            Self::with_priority(Priority::default())
        }

        fn with_priority(priority: Priority) -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::new(QosClass::Default, priority),
                released: AtomicBool::new(false),
            })
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Task for Spinner {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            while !self.released.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(5)).await;
            }
            true
        }

        fn as_pausable(&self) -> Option<&dyn Pausable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Pausable for Spinner {
        async fn pause(&self) -> bool {
            true
        }

        async fn resume(&self) -> bool {
            true
        }
    }

    /// Cancellable task: an accepted cancel releases its own spin loop; a
    /// refusing one keeps spinning until released by hand.
    struct Stopper {
        meta: TaskMeta,
        stop: AtomicBool,
        accept: bool,
    }

    impl Stopper {
        fn new() -> Arc<Self> {
            Self::with_priority(Priority::default())
        }

        fn with_priority(priority: Priority) -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::new(QosClass::Default, priority),
                stop: AtomicBool::new(false),
                accept: true,
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::default(),
                stop: AtomicBool::new(false),
                accept: false,
            })
        }

        fn release(&self) {
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Task for Stopper {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            while !self.stop.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(5)).await;
            }
            true
        }

        fn as_cancellable(&self) -> Option<&dyn Cancellable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Cancellable for Stopper {
        async fn cancel(&self) -> bool {
            if self.accept {
                self.stop.store(true, Ordering::SeqCst);
            }
            self.accept
        }
    }

    /// Pausable task whose resume hook refuses.
    struct NoComeback {
        meta: TaskMeta,
        released: AtomicBool,
    }

    impl NoComeback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::default(),
                released: AtomicBool::new(false),
            })
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Task for NoComeback {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            while !self.released.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(5)).await;
            }
            true
        }

        fn as_pausable(&self) -> Option<&dyn Pausable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Pausable for NoComeback {
        async fn pause(&self) -> bool {
            true
        }

        async fn resume(&self) -> bool {
            false
        }
    }

    /// Pausable task whose pause hook refuses.
    struct StubbornSpinner {
        meta: TaskMeta,
        released: AtomicBool,
    }

    impl StubbornSpinner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::default(),
                released: AtomicBool::new(false),
            })
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Task for StubbornSpinner {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            while !self.released.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(5)).await;
            }
            true
        }

        fn as_pausable(&self) -> Option<&dyn Pausable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Pausable for StubbornSpinner {
        async fn pause(&self) -> bool {
            false
        }

        async fn resume(&self) -> bool {
            true
        }
    }

    /// Configurable task.
    struct Configured {
        meta: TaskMeta,
        accept: bool,
        executed: AtomicBool,
    }

    impl Configured {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::default(),
                accept,
                executed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Task for Configured {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            self.executed.store(true, Ordering::SeqCst);
            true
        }

        fn as_configurable(&self) -> Option<&dyn Configurable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Configurable for Configured {
        async fn configure(&self) -> bool {
            self.accept
        }
    }

    /// Tracks how many run at once.
    struct Busy {
        meta: TaskMeta,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        hold: Duration,
    }

    impl Busy {
        fn new(current: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>, hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                meta: TaskMeta::default(),
                current: Arc::clone(current),
                peak: Arc::clone(peak),
                hold,
            })
        }
    }

    #[async_trait]
    impl Task for Busy {
        fn meta(&self) -> &TaskMeta {
            &self.meta
        }

        async fn execute(&self) -> bool {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    // ---- scenarios ----------------------------------------------------

    #[tokio::test]
    async fn fifo_within_a_band() {
        let log = new_log();
        let queue = TaskQueue::new("fifo", 1);
        let a = Step::new("a", Priority::MEDIUM, true, &log);
        let b = Step::new("b", Priority::MEDIUM, true, &log);
        let c = Step::new("c", Priority::MEDIUM, true, &log);
        queue
            .add_all([a.clone() as Arc<dyn Task>, b.clone(), c.clone()])
            .await;

        queue.start().await;
        queue.wait().await;

        let order: Vec<String> = entries(&log)
            .into_iter()
            .filter(|e| !e.starts_with("finish:"))
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(queue.counts().await.succeeded, 3);
        assert!(queue.is_done().await);
    }

    #[tokio::test]
    async fn higher_priority_is_picked_first() {
        let log = new_log();
        let queue = TaskQueue::new("pick", 1);
        let a = Step::new("a", Priority::LOW, true, &log);
        let b = Step::new("b", Priority::CRITICAL, true, &log);
        queue.add(a.clone()).await;
        queue.add(b.clone()).await;

        queue.start().await;
        queue.wait().await;

        let order: Vec<String> = entries(&log)
            .into_iter()
            .filter(|e| !e.starts_with("finish:"))
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn local_dependencies_run_inside_the_dependent_lifecycle() {
        let log = new_log();
        let queue = TaskQueue::new("deps", 2);
        let x = Step::new("x", Priority::MEDIUM, true, &log);
        let y = Step::new("y", Priority::MEDIUM, true, &log);
        let d = Chain::new("d", vec![x.clone(), y.clone()], &log);
        // Only the dependent is added; the dependencies are started in its
        // own lifecycle.
        queue.add(d.clone()).await;

        queue.start().await;
        queue.wait().await;

        let order: Vec<String> = entries(&log)
            .into_iter()
            .filter(|e| !e.starts_with("finish:"))
            .collect();
        assert_eq!(order, vec!["x", "y", "d"]);
        assert!(x.state().did_succeed());
        assert!(y.state().did_succeed());
        assert!(d.state().did_succeed());
        assert_eq!(*d.dep_order.lock().unwrap(), vec![x.id(), y.id()]);
        assert!(queue.is_done().await);
    }

    #[tokio::test]
    async fn dependency_failure_poisons_the_dependent() {
        let log = new_log();
        let queue = TaskQueue::new("poison", 2);
        let x = Step::new("x", Priority::MEDIUM, false, &log);
        let d = Chain::new("d", vec![x.clone()], &log);
        queue.add(x.clone()).await;
        queue.add(d.clone()).await;

        queue.start().await;
        queue.wait().await;

        assert_eq!(
            x.state().failure(),
            Some(FailureReason::In(Phase::Executing))
        );
        assert_eq!(
            d.state().failure(),
            Some(FailureReason::Dependency(x.id()))
        );
        assert!(!d.executed.load(Ordering::SeqCst));
        assert_eq!(queue.failed().await.len(), 2);
    }

    #[tokio::test]
    async fn pause_and_resume_a_running_task() {
        let queue = TaskQueue::new("pauses", 1);
        let spinner = Spinner::new();
        queue.add(spinner.clone()).await;
        queue.start().await;
        eventually("spinner executing", || spinner.state().is_executing()).await;

        queue.pause().await;
        assert!(spinner.state().is_paused());
        assert!(!queue.is_active().await);
        assert_eq!(queue.counts().await.paused, 1);

        queue.resume().await;
        eventually("spinner resumed", || spinner.state().is_executing()).await;
        assert!(queue.is_active().await);

        spinner.release();
        queue.wait().await;
        assert!(spinner.state().did_succeed());
    }

    // ---- invariants ---------------------------------------------------

    #[tokio::test]
    async fn concurrency_cap_is_never_exceeded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::new("capped", 2);
        for _ in 0..6 {
            queue
                .add(Busy::new(&current, &peak, Duration::from_millis(20)))
                .await;
        }

        queue.start().await;
        queue.wait().await;

        assert!(peak.load(Ordering::SeqCst) <= 2, "cap exceeded");
        assert_eq!(queue.counts().await.succeeded, 6);
    }

    #[tokio::test]
    async fn add_is_idempotent_on_the_task_id() {
        let log = new_log();
        let queue = TaskQueue::new("idem", 1);
        let a = Step::new("a", Priority::MEDIUM, true, &log);
        assert!(queue.add(a.clone()).await);
        assert!(!queue.add(a.clone()).await);
        assert_eq!(queue.waiting().await.len(), 1);
    }

    #[tokio::test]
    async fn start_is_a_no_op_when_active_and_add_keeps_draining() {
        let log = new_log();
        let queue = TaskQueue::new("live", 1);
        queue.start().await;
        queue.start().await;
        assert!(queue.is_active().await);

        let late = Step::new("late", Priority::MEDIUM, true, &log);
        queue.add(late.clone()).await;
        eventually("late task ran", || late.state().did_succeed()).await;
    }

    #[tokio::test]
    async fn configure_refusal_fails_in_that_phase() {
        let queue = TaskQueue::new("config", 1);
        let task = Configured::new(false);
        queue.add(task.clone()).await;
        queue.start().await;
        queue.wait().await;

        assert_eq!(
            task.state().failure(),
            Some(FailureReason::In(Phase::Configuring))
        );
        assert!(!task.executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_returns_the_cancelled_and_abandons_the_rest() {
        let queue = TaskQueue::new("axed", 2);
        let stopper = Stopper::new();
        let spinner = Spinner::new(); // pausable, not cancellable
        queue.add(stopper.clone()).await;
        queue.add(spinner.clone()).await;
        queue.start().await;
        eventually("both executing", || {
            stopper.state().is_executing() && spinner.state().is_executing()
        })
        .await;

        let cancelled = queue.cancel(true).await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id(), stopper.id());
        assert!(stopper.state().was_cancelled());
        assert!(!queue.is_active().await);

        // The abandoned task stays in the running view until its natural
        // exit, then lands in cancelled.
        assert_eq!(queue.running().await.len(), 1);
        spinner.release();
        eventually("abandoned task exited", || {
            spinner.state().was_cancelled()
        })
        .await;
        assert_eq!(queue.cancelled().await.len(), 2);
    }

    #[tokio::test]
    async fn wait_timeout_reports_and_a_plain_wait_recovers() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::new("slow", 1);
        queue
            .add(Busy::new(&current, &peak, Duration::from_millis(200)))
            .await;
        queue.start().await;

        let err = queue
            .wait_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::WaitTimeout { .. }));

        queue.wait().await;
        assert!(queue.is_done().await);
    }

    #[tokio::test]
    async fn notify_fires_after_the_tracked_tasks() {
        let log = new_log();
        let queue = TaskQueue::new("notify", 1);
        let a = Step::new("a", Priority::MEDIUM, true, &log);
        queue.add(a.clone()).await;
        queue.start().await;

        let seen = Arc::clone(&log);
        queue
            .notify(QosClass::Default, async move {
                push(&seen, "notified");
            })
            .await;

        queue.wait().await;
        eventually("notify ran", || {
            entries(&log).iter().any(|e| e == "notified")
        })
        .await;
        let order = entries(&log);
        assert!(order.iter().position(|e| e == "a").unwrap()
            < order.iter().position(|e| e == "notified").unwrap());
    }

    #[tokio::test]
    async fn finish_callback_fires_exactly_once() {
        let log = new_log();
        let queue = TaskQueue::new("once", 1);
        let a = Step::new("a", Priority::MEDIUM, true, &log);
        queue.add(a.clone()).await;
        queue.start().await;
        queue.wait().await;
        // Give any stray callback a chance to double-fire before counting.
        sleep(Duration::from_millis(30)).await;

        let finishes = entries(&log)
            .iter()
            .filter(|e| *e == "finish:a")
            .count();
        assert_eq!(finishes, 1);
    }

    #[tokio::test]
    async fn nested_local_dependencies_resolve_depth_first() {
        let log = new_log();
        let queue = TaskQueue::new("nested", 1);
        let z = Step::new("z", Priority::MEDIUM, true, &log);
        let y = Chain::new("y", vec![z.clone()], &log);
        let d = Chain::new("d", vec![y.clone()], &log);
        queue.add(d.clone()).await;

        queue.start().await;
        queue.wait().await;

        let order: Vec<String> = entries(&log)
            .into_iter()
            .filter(|e| !e.starts_with("finish:"))
            .collect();
        assert_eq!(order, vec!["z", "y", "d"]);
        assert!(z.state().did_succeed());
        assert!(y.state().did_succeed());
        assert!(d.state().did_succeed());
    }

    #[tokio::test]
    async fn a_refused_pause_fails_the_task_in_that_phase() {
        let queue = TaskQueue::new("stubborn", 1);
        let task = StubbornSpinner::new();
        queue.add(task.clone()).await;
        queue.start().await;
        eventually("task executing", || task.state().is_executing()).await;

        queue.pause().await;
        assert_eq!(
            task.state().failure(),
            Some(FailureReason::In(Phase::Pausing))
        );
        assert_eq!(queue.failed().await.len(), 1);

        // The refused task is terminal; waiters are not held up by its
        // still-running execute.
        queue.wait().await;
        task.release();
    }

    #[tokio::test]
    async fn a_refused_cancel_fails_the_task_in_that_phase() {
        let queue = TaskQueue::new("refuses", 1);
        let task = Stopper::refusing();
        queue.add(task.clone()).await;
        queue.start().await;
        eventually("task executing", || task.state().is_executing()).await;

        let cancelled = queue.cancel(false).await;
        assert!(cancelled.is_empty());
        assert_eq!(
            task.state().failure(),
            Some(FailureReason::In(Phase::Cancelling))
        );

        task.release();
    }

    #[tokio::test]
    async fn pause_reaches_a_dependency_claimed_by_a_dependent() {
        let log = new_log();
        let queue = TaskQueue::new("claimed-pause", 1);
        let dep = Spinner::with_priority(Priority::LOW);
        let d = Chain::new("d", vec![dep.clone()], &log);
        queue.add(dep.clone()).await;
        queue.add(d.clone()).await;

        // The dependent outranks its dependency, so the loop picks the
        // dependent and the dependency is started inline by its prepare.
        queue.start().await;
        eventually("claimed dependency executing", || {
            dep.state().is_executing()
        })
        .await;

        queue.pause().await;
        assert!(dep.state().is_paused());

        queue.resume().await;
        eventually("claimed dependency resumed", || {
            dep.state().is_executing()
        })
        .await;

        dep.release();
        queue.wait().await;
        assert!(dep.state().did_succeed());
        assert!(d.state().did_succeed());
    }

    #[tokio::test]
    async fn cancel_reaches_a_dependency_claimed_by_a_dependent() {
        let log = new_log();
        let queue = TaskQueue::new("claimed-cancel", 1);
        let dep = Stopper::with_priority(Priority::LOW);
        let d = Chain::new("d", vec![dep.clone()], &log);
        queue.add(dep.clone()).await;
        queue.add(d.clone()).await;

        queue.start().await;
        eventually("claimed dependency executing", || {
            dep.state().is_executing()
        })
        .await;

        let cancelled = queue.cancel(false).await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id(), dep.id());
        assert!(dep.state().was_cancelled());

        queue.wait().await;
        assert_eq!(
            d.state().failure(),
            Some(FailureReason::Dependency(dep.id()))
        );
        assert!(!d.executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_refused_resume_fails_the_task_in_that_phase() {
        let queue = TaskQueue::new("no-comeback", 1);
        let task = NoComeback::new();
        queue.add(task.clone()).await;
        queue.start().await;
        eventually("task executing", || task.state().is_executing()).await;

        queue.pause().await;
        assert!(task.state().is_paused());

        queue.resume().await;
        assert_eq!(
            task.state().failure(),
            Some(FailureReason::In(Phase::Resuming))
        );
        assert_eq!(queue.failed().await.len(), 1);

        task.release();
    }

    #[tokio::test]
    async fn duplicate_dependencies_are_resolved_once() {
        let log = new_log();
        let queue = TaskQueue::new("dedup", 1);
        let x = Step::new("x", Priority::MEDIUM, true, &log);
        let d = Chain::new("d", vec![x.clone(), x.clone()], &log);
        queue.add(d.clone()).await;

        queue.start().await;
        queue.wait().await;

        let runs = entries(&log).iter().filter(|e| *e == "x").count();
        assert_eq!(runs, 1);
        assert!(d.state().did_succeed());
    }

    #[tokio::test]
    async fn wait_until_respects_the_deadline() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue = TaskQueue::new("deadline", 1);
        queue
            .add(Busy::new(&current, &peak, Duration::from_millis(200)))
            .await;
        queue.start().await;

        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(queue.wait_until(deadline).await.is_err());

        queue.wait().await;
        assert!(queue.is_done().await);
    }

    /// Pool wrapper that records the QoS class of every spawn.
    struct RecordingPool {
        inner: crate::pool::TokioPool,
        seen: StdMutex<Vec<QosClass>>,
    }

    impl RecordingPool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: crate::pool::TokioPool,
                seen: StdMutex::new(Vec::new()),
            })
        }
    }

    impl crate::pool::WorkerPool for RecordingPool {
        fn spawn(&self, qos: QosClass, job: crate::pool::PoolJob) {
            self.seen.lock().unwrap().push(qos);
            self.inner.spawn(qos, job);
        }
    }

    #[tokio::test]
    async fn tasks_dispatch_under_their_own_qos_hint() {
        let pool = RecordingPool::new();
        let queue = TaskQueue::with_pool("hinted", 1, pool.clone());

        struct Hinted {
            meta: TaskMeta,
        }

        #[async_trait]
        impl Task for Hinted {
            fn meta(&self) -> &TaskMeta {
                &self.meta
            }

            async fn execute(&self) -> bool {
                true
            }
        }

        let background = Arc::new(Hinted {
            meta: TaskMeta::new(QosClass::Background, Priority::MEDIUM),
        });
        queue.add(background.clone()).await;
        queue.start().await;
        queue.wait().await;

        let seen = pool.seen.lock().unwrap().clone();
        assert!(seen.contains(&QosClass::Background));
    }

    #[tokio::test]
    async fn with_tasks_preloads_the_waiting_list() {
        let log = new_log();
        let a = Step::new("a", Priority::MEDIUM, true, &log);
        let b = Step::new("b", Priority::HIGH, true, &log);
        let queue = TaskQueue::with_tasks(
            "preloaded",
            1,
            vec![a.clone() as Arc<dyn Task>, b.clone()],
        )
        .await;
        assert_eq!(queue.waiting().await.len(), 2);

        queue.start().await;
        queue.wait().await;
        let order: Vec<String> = entries(&log)
            .into_iter()
            .filter(|e| !e.starts_with("finish:"))
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn counts_snapshot_partitions_every_task() {
        let log = new_log();
        let queue = TaskQueue::new("tally", 2);
        let ok = Step::new("ok", Priority::MEDIUM, true, &log);
        let bad = Step::new("bad", Priority::MEDIUM, false, &log);
        let parked = Step::new("parked", Priority::LOW, true, &log);
        queue.add(ok.clone()).await;
        queue.add(bad.clone()).await;

        queue.start().await;
        queue.wait().await;
        queue.pause().await;
        queue.add(parked.clone()).await;

        let counts = queue.counts().await;
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.remaining(), 1);
        assert!(!counts.is_done());
    }

    #[tokio::test]
    async fn every_added_task_terminates() {
        let log = new_log();
        let queue = TaskQueue::new("drain", 3);
        let mut tasks: Vec<Arc<Step>> = Vec::new();
        for i in 0..10u8 {
            let succeed = i % 3 != 0;
            let task = Step::new(
                if succeed { "ok" } else { "bad" },
                Priority::new(i * 20),
                succeed,
                &log,
            );
            tasks.push(task.clone());
            queue.add(task).await;
        }

        queue.start().await;
        queue.wait().await;

        for task in &tasks {
            assert!(task.state().is_terminal());
        }
        let counts = queue.counts().await;
        assert_eq!(counts.succeeded + counts.failed, 10);
        assert!(queue.is_done().await);
    }
}
