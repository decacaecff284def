use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    context::StageHandle,
    error::{ExecError, PipeError, Result},
    policy::PolicyKind,
    queue::{QueueStats, Rejected, WorkQueue},
    refs::{RefTable, Resolver, resolve_value},
    slot::Outcome,
    value::{Kwargs, RefId, Value, collect_refs},
    work::{WorkItem, WorkKey, WorkState},
};

/// The callable unit owned by a pipeline stage.
///
/// The runtime never looks inside a stage; it only hands it resolved arguments
/// and stores whatever it returns.
pub trait Stage: Send + 'static {
    fn forward(&mut self, args: Vec<Value>, kwargs: Kwargs) -> anyhow::Result<Value>;
}

impl<F> Stage for F
where
    F: FnMut(Vec<Value>, Kwargs) -> anyhow::Result<Value> + Send + 'static,
{
    fn forward(&mut self, args: Vec<Value>, kwargs: Kwargs) -> anyhow::Result<Value> {
        self(args, kwargs)
    }
}

/// Executes one stage's callable on a dedicated worker thread.
///
/// `invoke` never blocks: it queues a work item and returns the reference to its
/// result right away. The worker runs ready items one at a time and fills in
/// their result slots, a failing item never takes the worker down.
pub struct StageExecutor {
    name: String,
    rank: usize,
    queue: Arc<WorkQueue>,
    refs: Arc<RefTable>,
    resolver: Arc<dyn Resolver>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StageExecutor {
    /// Spawns the worker thread of a new stage.
    ///
    /// # Arguments
    /// * `name` - The stage's name, used as its registry key and in logs.
    /// * `stage` - The callable, exclusively owned by the worker thread.
    /// * `refs` - Where result slots of this stage are published.
    /// * `resolver` - Resolves the references found in incoming arguments.
    /// * `policy` - How the worker picks among ready items.
    ///
    /// # Returns
    /// The running executor or an io error if the thread could not be spawned.
    pub fn spawn(
        name: impl Into<String>,
        stage: Box<dyn Stage>,
        refs: Arc<RefTable>,
        resolver: Arc<dyn Resolver>,
        policy: PolicyKind,
    ) -> Result<Self> {
        let name = name.into();
        let rank = refs.rank();
        let queue = Arc::new(WorkQueue::new(policy.build()));

        let worker = {
            let name = name.clone();
            let queue = Arc::clone(&queue);
            let resolver = Arc::clone(&resolver);
            thread::Builder::new()
                .name(format!("worker_{name}"))
                .spawn(move || worker_loop(name, rank, stage, queue, resolver))?
        };

        info!("rank {rank} instantiated stage executor {name} ({policy:?})");

        Ok(Self {
            name,
            rank,
            queue,
            refs,
            resolver,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues a call of the stage and returns the reference to its result.
    ///
    /// Every distinct reference in `args` and `kwargs` becomes a dependency; the
    /// item only runs once all of them have resolved.
    ///
    /// # Arguments
    /// * `args` - Positional arguments.
    /// * `kwargs` - Keyword arguments.
    /// * `key` - Microbatch and phase of the call.
    ///
    /// # Returns
    /// The result's reference, `DuplicateKey` if `key` is still live on this
    /// stage or `StageClosed` after shutdown.
    pub fn invoke(&self, args: Vec<Value>, kwargs: Kwargs, key: WorkKey) -> Result<RefId> {
        let deps = collect_refs(&args, &kwargs);
        let (ref_id, slot) = self.refs.publish();
        let item = WorkItem::new(key, args, kwargs, ref_id, slot, deps.len());

        if let Err(rejected) = self.queue.submit(item) {
            self.refs.remove(ref_id);
            return Err(match rejected {
                Rejected::Duplicate => PipeError::DuplicateKey {
                    stage: self.name.clone(),
                    key,
                },
                Rejected::Closed => PipeError::StageClosed(self.name.clone()),
            });
        }

        debug!(
            "stage {} queued {key} as {ref_id} with {} dependencies",
            self.name,
            deps.len()
        );

        for dep in deps {
            let queue = Arc::clone(&self.queue);
            self.resolver.subscribe(
                dep,
                Box::new(move |outcome| queue.deliver(key, dep, outcome)),
            );
        }

        Ok(ref_id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// The item being run completes, items still queued fail with `StageClosed`.
    pub fn shutdown(&self) {
        for item in self.queue.shutdown() {
            let closed = PipeError::StageClosed(self.name.clone());
            let err = ExecError::new(&self.name, item.key.microbatch, closed.to_string());
            if !item.slot.set(Err(err)) {
                error!(stage = self.name.as_str(); "{}", PipeError::SlotAlreadySet(item.ref_id));
            }
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("worker thread of stage {} panicked", self.name);
            }
        }
    }
}

impl Drop for StageExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StageHandle for StageExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn invoke(&self, args: Vec<Value>, kwargs: Kwargs, key: WorkKey) -> Result<RefId> {
        StageExecutor::invoke(self, args, kwargs, key)
    }

    fn stats(&self) -> Result<QueueStats> {
        Ok(StageExecutor::stats(self))
    }
}

fn worker_loop(
    name: String,
    rank: usize,
    mut stage: Box<dyn Stage>,
    queue: Arc<WorkQueue>,
    resolver: Arc<dyn Resolver>,
) {
    while let Some(mut item) = queue.next() {
        let microbatch = item.key.microbatch;
        debug!("rank {rank} running microbatch {microbatch} target {name}");

        let outcome = execute(&name, stage.as_mut(), &mut item, resolver.as_ref());
        if let Err(e) = &outcome {
            warn!(stage = name.as_str(), microbatch = microbatch; "work item failed: {e}");
        }

        queue.finish(item.key);
        item.advance(WorkState::Done);

        if !item.slot.set(outcome) {
            error!(stage = name.as_str(); "{}", PipeError::SlotAlreadySet(item.ref_id));
        }
    }

    debug!("rank {rank} stage {name} worker exiting");
}

fn execute(
    name: &str,
    stage: &mut dyn Stage,
    item: &mut WorkItem,
    resolver: &dyn Resolver,
) -> Outcome {
    let microbatch = item.key.microbatch;
    let ready = std::mem::take(&mut item.ready_args);
    let mut lookup = |id: RefId| match ready.get(&id) {
        Some(outcome) => outcome.clone(),
        None => resolver.resolve(id),
    };

    let mut args = Vec::with_capacity(item.args.len());
    for arg in std::mem::take(&mut item.args) {
        let arg = arg.try_map_refs(&mut lookup)?;
        args.push(resolve_value(resolver, arg)?);
    }

    let mut kwargs = Kwargs::new();
    for (key, arg) in std::mem::take(&mut item.kwargs) {
        let arg = arg.try_map_refs(&mut lookup)?;
        kwargs.insert(key, resolve_value(resolver, arg)?);
    }

    match panic::catch_unwind(AssertUnwindSafe(|| stage.forward(args, kwargs))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecError::new(name, microbatch, format!("{e:#}"))),
        Err(payload) => Err(ExecError::new(name, microbatch, panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use anyhow::bail;
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn spawn<S: Stage>(name: &str, refs: &Arc<RefTable>, stage: S) -> StageExecutor {
        let resolver: Arc<dyn Resolver> = refs.clone();
        StageExecutor::spawn(name, Box::new(stage), Arc::clone(refs), resolver, PolicyKind::Fifo)
            .unwrap()
    }

    fn scalar(v: f32) -> Value {
        Value::Tensor(ArrayD::from_elem(IxDyn(&[1]), v))
    }

    fn add_one(args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        match args.into_iter().next() {
            Some(Value::Tensor(t)) => Ok(Value::Tensor(t + 1.0)),
            other => bail!("expected a tensor, got {other:?}"),
        }
    }

    #[test]
    fn invoke_returns_before_the_stage_runs() {
        let refs = Arc::new(RefTable::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = parking_lot::Mutex::new(gate_rx);

        let exec = spawn("gated", &refs, move |args: Vec<Value>, _: Kwargs| -> anyhow::Result<Value> {
            gate_rx.lock().recv()?;
            Ok(args.into_iter().next().unwrap_or(Value::None))
        });

        let start = Instant::now();
        let id = exec.invoke(vec![Value::Int(7)], Kwargs::new(), WorkKey::forward(0)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!refs.slot(id).unwrap().is_set());

        gate_tx.send(()).unwrap();
        assert_eq!(refs.resolve(id), Ok(Value::Int(7)));
    }

    #[test]
    fn duplicate_keys_are_rejected_while_live() {
        let refs = Arc::new(RefTable::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = parking_lot::Mutex::new(gate_rx);

        let exec = spawn("gated", &refs, move |_: Vec<Value>, _: Kwargs| -> anyhow::Result<Value> {
            gate_rx.lock().recv()?;
            Ok(Value::None)
        });

        let key = WorkKey::forward(1);
        let first = exec.invoke(Vec::new(), Kwargs::new(), key).unwrap();

        let err = exec.invoke(Vec::new(), Kwargs::new(), key).unwrap_err();
        assert!(matches!(err, PipeError::DuplicateKey { key: k, .. } if k == key));
        assert!(exec.invoke(Vec::new(), Kwargs::new(), WorkKey::backward(1)).is_ok());

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert_eq!(refs.resolve(first), Ok(Value::None));
    }

    #[test]
    fn failures_are_stored_and_the_worker_keeps_going() {
        let refs = Arc::new(RefTable::new(0));
        let exec = spawn("picky", &refs, |args: Vec<Value>, _: Kwargs| -> anyhow::Result<Value> {
            match &args[0] {
                Value::Int(1) => bail!("microbatch one is cursed"),
                Value::Int(2) => panic!("unexpected two"),
                other => Ok(other.clone()),
            }
        });

        let ids: Vec<_> = (0..4)
            .map(|mb| {
                exec.invoke(vec![Value::Int(mb as i64)], Kwargs::new(), WorkKey::forward(mb))
                    .unwrap()
            })
            .collect();

        assert_eq!(refs.resolve(ids[0]), Ok(Value::Int(0)));
        assert_eq!(refs.resolve(ids[3]), Ok(Value::Int(3)));

        let err = refs.resolve(ids[1]).unwrap_err();
        assert_eq!(err.microbatch, Some(1));
        assert!(err.msg.contains("cursed"));
        assert_eq!(refs.resolve(ids[1]), Err(err));

        let err = refs.resolve(ids[2]).unwrap_err();
        assert!(err.msg.contains("unexpected two"));
        assert_eq!(exec.stats().completed, 4);
    }

    #[test]
    fn items_wait_for_their_dependencies() {
        let refs = Arc::new(RefTable::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = parking_lot::Mutex::new(gate_rx);

        let first = spawn("first", &refs, move |args: Vec<Value>, kw: Kwargs| -> anyhow::Result<Value> {
            gate_rx.lock().recv()?;
            add_one(args, kw)
        });
        let second = spawn("second", &refs, add_one);

        let a = first.invoke(vec![scalar(1.0)], Kwargs::new(), WorkKey::forward(0)).unwrap();
        let b = second
            .invoke(vec![Value::Deferred(a)], Kwargs::new(), WorkKey::forward(0))
            .unwrap();

        assert_eq!(second.stats().waiting, 1);

        gate_tx.send(()).unwrap();
        assert_eq!(refs.resolve(b), Ok(scalar(3.0)));
        assert_eq!(second.stats().waiting, 0);
    }

    #[test]
    fn failed_dependencies_poison_only_their_consumers() {
        let refs = Arc::new(RefTable::new(0));
        let called = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let source = spawn("source", &refs, |args: Vec<Value>, _: Kwargs| -> anyhow::Result<Value> {
            match &args[0] {
                Value::Int(1) => bail!("bad source"),
                other => Ok(other.clone()),
            }
        });
        let sink = {
            let called = Arc::clone(&called);
            spawn("sink", &refs, move |args: Vec<Value>, _: Kwargs| -> anyhow::Result<Value> {
                called.lock().push(args[0].clone());
                Ok(args[0].clone())
            })
        };

        let outs: Vec<_> = (0..3)
            .map(|mb| {
                let key = WorkKey::forward(mb);
                let a = source.invoke(vec![Value::Int(mb as i64)], Kwargs::new(), key).unwrap();
                sink.invoke(vec![Value::Deferred(a)], Kwargs::new(), key).unwrap()
            })
            .collect();

        assert_eq!(refs.resolve(outs[0]), Ok(Value::Int(0)));
        assert_eq!(refs.resolve(outs[2]), Ok(Value::Int(2)));

        let err = refs.resolve(outs[1]).unwrap_err();
        assert_eq!(err.stage, "source");
        assert!(!called.lock().contains(&Value::Int(1)));
    }

    #[test]
    fn kwargs_references_are_resolved() {
        let refs = Arc::new(RefTable::new(0));
        let producer = spawn("producer", &refs, add_one);
        let consumer = spawn("consumer", &refs, |_: Vec<Value>, kw: Kwargs| -> anyhow::Result<Value> {
            Ok(kw.get("skip").cloned().unwrap_or(Value::None))
        });

        let a = producer.invoke(vec![scalar(0.0)], Kwargs::new(), WorkKey::forward(0)).unwrap();
        let mut kwargs = Kwargs::new();
        kwargs.insert("skip".into(), Value::Tuple(vec![Value::Deferred(a)]));
        let b = consumer.invoke(Vec::new(), kwargs, WorkKey::forward(0)).unwrap();

        assert_eq!(refs.resolve(b), Ok(Value::Tuple(vec![scalar(1.0)])));
    }

    #[test]
    fn shutdown_fails_queued_items() {
        let refs = Arc::new(RefTable::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = parking_lot::Mutex::new(gate_rx);

        let exec = Arc::new(spawn("gated", &refs, move |args: Vec<Value>, _: Kwargs| -> anyhow::Result<Value> {
            gate_rx.lock().recv()?;
            Ok(args.into_iter().next().unwrap_or(Value::None))
        }));

        let running = exec.invoke(vec![Value::Int(0)], Kwargs::new(), WorkKey::forward(0)).unwrap();
        let ready = exec.invoke(vec![Value::Int(1)], Kwargs::new(), WorkKey::forward(1)).unwrap();
        let waiting = exec
            .invoke(vec![Value::Deferred(running)], Kwargs::new(), WorkKey::forward(2))
            .unwrap();

        while exec.stats().running == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let stopper = {
            let exec = Arc::clone(&exec);
            thread::spawn(move || exec.shutdown())
        };

        for (id, microbatch) in [(ready, 1), (waiting, 2)] {
            let err = refs.slot(id).unwrap().wait().unwrap_err();
            assert_eq!(err.stage, "gated");
            assert_eq!(err.microbatch, Some(microbatch));
            assert!(err.msg.contains("shut down"));
        }

        gate_tx.send(()).unwrap();
        stopper.join().unwrap();
        assert_eq!(refs.resolve(running), Ok(Value::Int(0)));
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let refs = Arc::new(RefTable::new(0));
        let exec = spawn("done", &refs, add_one);
        exec.shutdown();

        let err = exec.invoke(vec![scalar(0.0)], Kwargs::new(), WorkKey::forward(0));
        assert!(matches!(err, Err(PipeError::StageClosed(_))));
        assert!(refs.is_empty());
    }
}
