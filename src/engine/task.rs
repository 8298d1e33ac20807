//! Task handles returned by the engine.

use crate::engine::{RequestHead, ResumeData};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Data,
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, waiting for [`SessionTask::resume`].
    Suspended,
    Running,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_expected_to_receive: Option<u64>,
}

/// Runs the transfer. Called at most once, on resume, or on cancel of a
/// task that never started so its completion is still delivered.
pub(crate) type TaskStarter = Box<dyn FnOnce(SessionTask) + Send>;

/// A handle on one transfer. Clones refer to the same task.
#[derive(Clone)]
pub struct SessionTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: TaskId,
    kind: TaskKind,
    original_request: RequestHead,
    state: Mutex<TaskState>,
    starter: Mutex<Option<TaskStarter>>,
    cancellation: CancellationToken,
    progress: Mutex<TaskProgress>,
    resume_data: Mutex<Option<ResumeData>>,
}

impl fmt::Debug for SessionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTask")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .field("url", &self.inner.original_request.uri)
            .finish()
    }
}

impl PartialEq for SessionTask {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SessionTask {}

impl SessionTask {
    pub(crate) fn new(kind: TaskKind, original_request: RequestHead, starter: TaskStarter) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                original_request,
                state: Mutex::new(TaskState::Suspended),
                starter: Mutex::new(Some(starter)),
                cancellation: CancellationToken::new(),
                progress: Mutex::new(TaskProgress::default()),
                resume_data: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    /// The request as handed to the engine, token header included.
    pub fn original_request(&self) -> &RequestHead {
        &self.inner.original_request
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn progress(&self) -> TaskProgress {
        *self.inner.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Start the transfer. No effect unless the task is suspended.
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != TaskState::Suspended {
                return;
            }
            *state = TaskState::Running;
        }
        self.start();
    }

    /// Cancel the transfer. The completion reports
    /// [`SessionError::Cancelled`](crate::SessionError::Cancelled).
    pub fn cancel(&self) {
        let previous = {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            match previous {
                TaskState::Suspended | TaskState::Running => *state = TaskState::Cancelled,
                TaskState::Cancelled | TaskState::Completed => return,
            }
            previous
        };
        debug!("Cancelling task {}", self.inner.id);
        self.inner.cancellation.cancel();
        if previous == TaskState::Suspended {
            self.start();
        }
    }

    /// Cancel a download and return the data needed to continue it later.
    /// `None` for other task kinds or when nothing has been received yet.
    pub fn cancel_producing_resume_data(&self) -> Option<Vec<u8>> {
        let resume_data = self
            .inner
            .resume_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.cancel();
        resume_data.and_then(|data| data.encode().ok())
    }

    fn start(&self) {
        let starter = self
            .inner
            .starter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(starter) = starter {
            starter(self.clone());
        }
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancellation.cancelled()
    }

    pub(crate) fn mark_completed(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == TaskState::Running {
            *state = TaskState::Completed;
        }
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes_sent += bytes;
    }

    pub(crate) fn record_received(&self, bytes: u64, expected: Option<u64>) {
        let mut progress = self.inner.progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.bytes_received += bytes;
        progress.bytes_expected_to_receive = expected;
    }

    pub(crate) fn set_resume_data(&self, resume_data: ResumeData) {
        *self
            .inner
            .resume_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resume_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, Uri};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn head() -> RequestHead {
        RequestHead {
            method: Method::GET,
            uri: Uri::from_static("https://api.example.com/file"),
            headers: Default::default(),
        }
    }

    fn counting_task(kind: TaskKind) -> (SessionTask, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let task = SessionTask::new(
            kind,
            head(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (task, starts)
    }

    #[test]
    fn test_resume_starts_once() {
        let (task, starts) = counting_task(TaskKind::Data);
        assert_eq!(task.state(), TaskState::Suspended);

        task.resume();
        task.resume();
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        task.mark_completed();
        task.cancel();
        assert_eq!(task.state(), TaskState::Completed);
        assert!(!task.is_cancelled());
    }

    #[test]
    fn test_cancel_before_resume_still_starts() {
        let (task, starts) = counting_task(TaskKind::Data);
        task.cancel();
        assert!(task.is_cancelled());
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        task.resume();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_data_snapshot() {
        let (task, _) = counting_task(TaskKind::Download);
        task.resume();
        task.set_resume_data(ResumeData {
            url: "https://api.example.com/file".to_string(),
            headers: vec![("accept".to_string(), "*/*".to_string())],
            partial_path: PathBuf::from("/tmp/download-1.part"),
            offset: 42,
        });

        let encoded = task.cancel_producing_resume_data().unwrap();
        assert!(task.is_cancelled());
        assert_eq!(ResumeData::decode(&encoded).unwrap().offset, 42);
    }

    #[test]
    fn test_clones_share_identity() {
        let (task, _) = counting_task(TaskKind::Upload);
        let (other, _) = counting_task(TaskKind::Upload);
        assert_eq!(task.clone(), task);
        assert_ne!(task, other);
        assert_ne!(task.id(), other.id());
    }
}
