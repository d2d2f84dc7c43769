/// Shared, ref-counted, cancellable pyramid loading
///
/// One `PyramidLoader` exists per photo. The first preview request spawns a
/// single background job that opens-or-generates the pyramid; every further
/// request chains off that shared task. Cancelling one request never
/// disturbs its peers; only dropping the last referencing handle cancels the
/// shared work.

use image::DynamicImage;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pyramid::file::PyramidFile;
use crate::pyramid::generator::PyramidGenerator;
use crate::scheduler::{BackgroundScheduler, Job};
use crate::sources::Photo;

struct TaskState {
    refs: usize,
    cancelled: bool,
    result: Option<Result<Arc<PyramidFile>>>,
}

/// The deduplicated unit of background work: produces one photo's pyramid
/// exactly once, no matter how many requests reference it.
struct SharedPyramidTask {
    state: Mutex<TaskState>,
    done: Condvar,
}

impl SharedPyramidTask {
    /// Created already holding the first requester's reference.
    fn new() -> Arc<Self> {
        Arc::new(SharedPyramidTask {
            state: Mutex::new(TaskState {
                refs: 1,
                cancelled: false,
                result: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Take a reference if the task can still serve a new request. Refuses a
    /// cancelled task and one that completed with an error; the caller
    /// starts a fresh task instead of joining a dead one. The check and the
    /// increment share one lock, so a concurrent last-handle drop can never
    /// cancel a task that was just handed out.
    fn try_add_ref(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancelled || matches!(state.result, Some(Err(_))) {
            return false;
        }
        state.refs += 1;
        true
    }

    /// Drop one reference. The shared work is cancelled only when the last
    /// reference goes away.
    fn release_ref(&self) {
        let mut state = self.state.lock();
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 && state.result.is_none() {
            state.cancelled = true;
            self.done.notify_all();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn complete(&self, result: Result<Arc<PyramidFile>>) {
        let mut state = self.state.lock();
        if state.result.is_none() {
            state.result = Some(result);
        }
        self.done.notify_all();
    }

    /// Block until the shared result is in (or the task was cancelled).
    fn wait_result(&self) -> Result<Arc<PyramidFile>> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            self.done.wait(&mut state);
        }
    }
}

struct LoadPyramidJob {
    photo: Arc<dyn Photo>,
    cache_dir: PathBuf,
    task: Arc<SharedPyramidTask>,
}

impl Job for LoadPyramidJob {
    fn title(&self) -> String {
        format!("load pyramid for {}", self.photo.uri())
    }

    fn run(&mut self) -> Result<()> {
        if self.task.is_cancelled() {
            self.task.complete(Err(Error::Cancelled));
            return Err(Error::Cancelled);
        }

        let result = PyramidGenerator::load_or_generate(self.photo.as_ref(), &self.cache_dir)
            .map(Arc::new);
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.task.complete(result);
        outcome
    }
}

/// A pending "best preview" request. Dropping the handle releases its
/// reference on the shared task; `cancel` abandons just this request.
pub struct PreviewHandle {
    task: Arc<SharedPyramidTask>,
    width: u32,
    height: u32,
    cancelled: AtomicBool,
}

impl PreviewHandle {
    /// Abandon this request. Peers sharing the pyramid task are unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Block until the pyramid is ready, then decode the best-fit tile.
    pub fn wait(&self) -> Result<Arc<DynamicImage>> {
        let pyramid = self.task.wait_result()?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let tile = pyramid.find_best(self.width, self.height)?;
        pyramid.decode(tile)
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.task.release_ref();
    }
}

/// A pending "is this tile still the best one" query.
pub struct CheckHandle {
    task: Arc<SharedPyramidTask>,
    have: (u32, u32),
    desired: (u32, u32),
    cancelled: AtomicBool,
}

impl CheckHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn wait(&self) -> Result<bool> {
        let pyramid = self.task.wait_result()?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        pyramid.is_best_size(self.have.0, self.have.1, self.desired.0, self.desired.1)
    }
}

impl Drop for CheckHandle {
    fn drop(&mut self) {
        self.task.release_ref();
    }
}

/// Per-photo loader that deduplicates pyramid production and answers size
/// queries against the result.
pub struct PyramidLoader {
    photo: Arc<dyn Photo>,
    cache_dir: PathBuf,
    shared: Mutex<Option<Arc<SharedPyramidTask>>>,
}

impl PyramidLoader {
    pub fn new(photo: Arc<dyn Photo>, cache_dir: PathBuf) -> Self {
        PyramidLoader {
            photo,
            cache_dir,
            shared: Mutex::new(None),
        }
    }

    /// Request the best-fitting tile for the given box as a decoded image.
    pub fn request_best_preview(
        &self,
        scheduler: &BackgroundScheduler,
        width: u32,
        height: u32,
    ) -> PreviewHandle {
        let task = self.ensure_shared(scheduler);
        PreviewHandle {
            task,
            width,
            height,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Ask whether a tile of `have` dimensions is still the best pick for
    /// the desired box.
    pub fn is_best_preview(
        &self,
        scheduler: &BackgroundScheduler,
        have_width: u32,
        have_height: u32,
        desired_width: u32,
        desired_height: u32,
    ) -> CheckHandle {
        let task = self.ensure_shared(scheduler);
        CheckHandle {
            task,
            have: (have_width, have_height),
            desired: (desired_width, desired_height),
            cancelled: AtomicBool::new(false),
        }
    }

    // Check-then-create is atomic under the loader's lock: exactly one live
    // shared task exists even under concurrent first calls. The reference is
    // taken inside `try_add_ref`, together with its liveness check; a task
    // that was cancelled or that failed is replaced, so a later request
    // retries instead of replaying the cached error.
    fn ensure_shared(&self, scheduler: &BackgroundScheduler) -> Arc<SharedPyramidTask> {
        let mut shared = self.shared.lock();
        if let Some(task) = shared.as_ref() {
            if task.try_add_ref() {
                return Arc::clone(task);
            }
        }

        let task = SharedPyramidTask::new();
        scheduler.submit(Box::new(LoadPyramidJob {
            photo: Arc::clone(&self.photo),
            cache_dir: self.cache_dir.clone(),
            task: Arc::clone(&task),
        }));
        *shared = Some(Arc::clone(&task));
        task
    }
}

impl std::fmt::Debug for PyramidLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidLoader")
            .field("uri", &self.photo.uri())
            .finish()
    }
}
