//! Delayed-disposal wrappers for containers and buffers

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::container::{Container, ContainerKind, InputStream, OutputStream, RandomBuffer};
use crate::error::{Result, VesselError};
use crate::persist::{self, DelayedPayload, RestoreContext};

use super::{CommitTracker, DisposalState};

// =============================================================================
// Shared Core
// =============================================================================

/// What the deletion callback needs from the wrapped layer
trait Disposable: Send + Sync + 'static {
    fn dispose_storage(&self) -> Result<()>;
    fn label(&self) -> String;
}

impl Disposable for dyn Container {
    fn dispose_storage(&self) -> Result<()> {
        Container::dispose(self)
    }

    fn label(&self) -> String {
        Container::name(self)
    }
}

impl Disposable for dyn RandomBuffer {
    fn dispose_storage(&self) -> Result<()> {
        RandomBuffer::dispose(self)
    }

    fn label(&self) -> String {
        RandomBuffer::name(self)
    }
}

/// Bookkeeping shared by both wrappers
///
/// The inner layer sits in a shared slot so the tracker's callback can reach
/// it after the wrapper itself is gone. The slot is only emptied when a
/// buffer is converted back into a container.
struct DisposalCore<T: ?Sized + Disposable> {
    slot: Arc<RwLock<Option<Box<T>>>>,
    /// Stable name of the physical storage, shared by every alias of it
    identity: String,
    /// Tracker's current commit when the storage was created
    commit_id_at_creation: u64,
    tracker: Arc<dyn CommitTracker>,
    /// Shadows never register a deletion
    shadow: bool,
    /// Shared with the tracker callback, which moves it to `Disposed`
    state: Arc<Mutex<DisposalState>>,
}

impl<T: ?Sized + Disposable> DisposalCore<T> {
    fn new(
        inner: Box<T>,
        identity: String,
        commit_id_at_creation: u64,
        tracker: Arc<dyn CommitTracker>,
        shadow: bool,
    ) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(inner))),
            identity,
            commit_id_at_creation,
            tracker,
            shadow,
            state: Arc::new(Mutex::new(DisposalState::Active)),
        }
    }

    /// Same identity and tracker over a different inner layer
    fn sibling<U: ?Sized + Disposable>(&self, inner: Box<U>, shadow: bool) -> DisposalCore<U> {
        DisposalCore::new(
            inner,
            self.identity.clone(),
            self.commit_id_at_creation,
            Arc::clone(&self.tracker),
            shadow,
        )
    }

    fn state(&self) -> DisposalState {
        *self.state.lock()
    }

    /// Run `f` against the inner layer, rejecting use after dispose
    fn with_inner<R>(&self, f: impl FnOnce(&T) -> Result<R>) -> Result<R> {
        if self.state() != DisposalState::Active {
            return Err(VesselError::Resource(format!("{} is disposed", self.identity)));
        }
        let slot = self.slot.read();
        match slot.as_deref() {
            Some(inner) => f(inner),
            None => Err(VesselError::Resource(format!("{} was converted", self.identity))),
        }
    }

    /// Inspect the inner layer regardless of state
    fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slot.read().as_deref().map(f)
    }

    fn take_inner(&self) -> Result<Box<T>> {
        if self.state() != DisposalState::Active {
            return Err(VesselError::Resource(format!("{} is disposed", self.identity)));
        }
        self.slot
            .write()
            .take()
            .ok_or_else(|| VesselError::Resource(format!("{} was converted", self.identity)))
    }

    fn deletion_callback(&self) -> super::DeleteCallback {
        let slot = Arc::clone(&self.slot);
        let state = Arc::clone(&self.state);
        Box::new(move || complete_disposal(&slot, &state))
    }

    /// Logical dispose: hand physical deletion to the tracker
    fn dispose(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != DisposalState::Active {
                return Ok(());
            }
            if self.shadow {
                *state = DisposalState::Disposed;
                drop(state);
                return match self.peek(|inner| inner.dispose_storage()) {
                    Some(result) => result,
                    None => Ok(()),
                };
            }
            *state = DisposalState::Pending;
        }

        if let Err(e) = self.register() {
            *self.state.lock() = DisposalState::Active;
            return Err(e);
        }
        debug!(identity = %self.identity, commit_id = self.commit_id_at_creation, "Disposal deferred");
        Ok(())
    }

    fn register(&self) -> Result<()> {
        self.tracker.register_for_deferred_deletion(
            &self.identity,
            self.commit_id_at_creation,
            self.deletion_callback(),
        )
    }

    /// Put a resumed wrapper back into the pending state
    fn resume_pending(&self) -> Result<()> {
        *self.state.lock() = DisposalState::Pending;
        self.register()
    }

    fn persist(&self, magic: u32, inner: impl FnOnce(&T) -> Result<Vec<u8>>) -> Result<Vec<u8>> {
        let state = self.state();
        if state == DisposalState::Disposed {
            return Err(VesselError::Resource(format!("{} is already disposed", self.identity)));
        }
        let inner = self
            .peek(inner)
            .ok_or_else(|| VesselError::Resource(format!("{} was converted", self.identity)))??;
        let payload = DelayedPayload {
            identity: self.identity.clone(),
            commit_id_at_creation: self.commit_id_at_creation,
            pending: state == DisposalState::Pending,
            shadow: self.shadow,
            inner,
        };
        persist::encode_frame(magic, &payload)
    }

    fn debug_fields(&self, f: &mut fmt::DebugStruct<'_, '_>) {
        f.field("identity", &self.identity)
            .field("commit_id_at_creation", &self.commit_id_at_creation)
            .field("state", &self.state())
            .field("shadow", &self.shadow);
    }
}

fn complete_disposal<T: ?Sized + Disposable>(
    slot: &RwLock<Option<Box<T>>>,
    state: &Mutex<DisposalState>,
) -> Result<()> {
    {
        let mut state = state.lock();
        if *state == DisposalState::Disposed {
            return Ok(());
        }
        *state = DisposalState::Disposed;
    }
    match slot.read().as_deref() {
        Some(inner) => {
            debug!(inner = %inner.label(), "Physically disposing");
            inner.dispose_storage()
        }
        None => Ok(()),
    }
}

fn restore_core<T: ?Sized + Disposable>(
    payload: &DelayedPayload,
    inner: Box<T>,
    ctx: &RestoreContext,
) -> Result<DisposalCore<T>> {
    let tracker = ctx.require_tracker(&payload.identity)?;
    let core = DisposalCore::new(
        inner,
        payload.identity.clone(),
        payload.commit_id_at_creation,
        tracker,
        payload.shadow,
    );
    if payload.pending {
        core.resume_pending()?;
    }
    Ok(core)
}

// =============================================================================
// DelayedDisposalContainer
// =============================================================================

/// Container whose `dispose()` only schedules physical deletion
pub struct DelayedDisposalContainer {
    core: DisposalCore<dyn Container>,
}

impl DelayedDisposalContainer {
    /// Wrap `inner`, recording the tracker's current commit id
    pub fn new(inner: Box<dyn Container>, tracker: Arc<dyn CommitTracker>) -> Self {
        let identity = inner.name();
        Self::with_identity(inner, identity, tracker)
    }

    pub fn with_identity(inner: Box<dyn Container>, identity: impl Into<String>, tracker: Arc<dyn CommitTracker>) -> Self {
        let commit_id = tracker.current_commit_id();
        Self {
            core: DisposalCore::new(inner, identity.into(), commit_id, tracker, false),
        }
    }

    pub(crate) fn from_payload(payload: DelayedPayload, inner: Box<dyn Container>, ctx: &RestoreContext) -> Result<Self> {
        Ok(Self {
            core: restore_core(&payload, inner, ctx)?,
        })
    }

    pub fn identity(&self) -> &str {
        &self.core.identity
    }

    pub fn commit_id_at_creation(&self) -> u64 {
        self.core.commit_id_at_creation
    }

    pub fn state(&self) -> DisposalState {
        self.core.state()
    }
}

impl fmt::Debug for DelayedDisposalContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DelayedDisposalContainer");
        self.core.debug_fields(&mut s);
        s.finish()
    }
}

impl Container for DelayedDisposalContainer {
    fn output_stream(&self) -> Result<Box<dyn OutputStream>> {
        self.core.with_inner(|inner| inner.output_stream())
    }

    fn input_stream(&self) -> Result<Option<Box<dyn InputStream>>> {
        self.core.with_inner(|inner| inner.input_stream())
    }

    fn size(&self) -> u64 {
        self.core.peek(|inner| inner.size()).unwrap_or(0)
    }

    fn is_read_only(&self) -> bool {
        self.core.peek(|inner| inner.is_read_only()).unwrap_or(true)
    }

    fn set_read_only(&self) {
        self.core.peek(|inner| inner.set_read_only());
    }

    fn is_disposed(&self) -> bool {
        self.core.state() != DisposalState::Active
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn Container>>> {
        let Some(shadow) = self.core.with_inner(|inner| inner.create_shadow())? else {
            return Ok(None);
        };
        shadow.set_read_only();
        Ok(Some(Box::new(DelayedDisposalContainer {
            core: self.core.sibling(shadow, true),
        })))
    }

    fn close(&self) -> Result<()> {
        self.core.peek(|inner| inner.close()).unwrap_or(Ok(()))
    }

    fn dispose(&self) -> Result<()> {
        self.core.dispose()
    }

    fn to_random_buffer(&self) -> Result<Box<dyn RandomBuffer>> {
        let view = self.core.with_inner(|inner| inner.to_random_buffer())?;
        Ok(Box::new(DelayedDisposalBuffer {
            core: self.core.sibling(view, self.core.shadow),
        }))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        self.core
            .persist(persist::DELAYED_CONTAINER_MAGIC, |inner| inner.persist())
    }

    fn name(&self) -> String {
        match self.core.peek(|inner| inner.name()) {
            Some(name) => format!("delayed({})", name),
            None => format!("delayed({})", self.core.identity),
        }
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::DelayedDisposal
    }
}

// =============================================================================
// DelayedDisposalBuffer
// =============================================================================

/// Random-access counterpart of [`DelayedDisposalContainer`]
pub struct DelayedDisposalBuffer {
    core: DisposalCore<dyn RandomBuffer>,
}

impl DelayedDisposalBuffer {
    pub fn new(inner: Box<dyn RandomBuffer>, tracker: Arc<dyn CommitTracker>) -> Self {
        let identity = inner.name();
        Self::with_identity(inner, identity, tracker)
    }

    pub fn with_identity(inner: Box<dyn RandomBuffer>, identity: impl Into<String>, tracker: Arc<dyn CommitTracker>) -> Self {
        let commit_id = tracker.current_commit_id();
        Self {
            core: DisposalCore::new(inner, identity.into(), commit_id, tracker, false),
        }
    }

    pub(crate) fn from_payload(
        payload: DelayedPayload,
        inner: Box<dyn RandomBuffer>,
        ctx: &RestoreContext,
    ) -> Result<Self> {
        Ok(Self {
            core: restore_core(&payload, inner, ctx)?,
        })
    }

    pub fn identity(&self) -> &str {
        &self.core.identity
    }

    pub fn commit_id_at_creation(&self) -> u64 {
        self.core.commit_id_at_creation
    }

    pub fn state(&self) -> DisposalState {
        self.core.state()
    }
}

impl fmt::Debug for DelayedDisposalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DelayedDisposalBuffer");
        self.core.debug_fields(&mut s);
        s.finish()
    }
}

impl RandomBuffer for DelayedDisposalBuffer {
    fn size(&self) -> u64 {
        self.core.peek(|inner| inner.size()).unwrap_or(0)
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.core.with_inner(|inner| inner.pread(offset, buf))
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.core.with_inner(|inner| inner.pwrite(offset, data))
    }

    fn is_read_only(&self) -> bool {
        self.core.peek(|inner| inner.is_read_only()).unwrap_or(true)
    }

    fn set_read_only(&self) {
        self.core.peek(|inner| inner.set_read_only());
    }

    fn is_disposed(&self) -> bool {
        self.core.state() != DisposalState::Active
    }

    fn create_shadow(&self) -> Result<Option<Box<dyn RandomBuffer>>> {
        let Some(shadow) = self.core.with_inner(|inner| inner.create_shadow())? else {
            return Ok(None);
        };
        shadow.set_read_only();
        Ok(Some(Box::new(DelayedDisposalBuffer {
            core: self.core.sibling(shadow, true),
        })))
    }

    fn close(&self) -> Result<()> {
        self.core.peek(|inner| inner.close()).unwrap_or(Ok(()))
    }

    fn dispose(&self) -> Result<()> {
        self.core.dispose()
    }

    fn into_container(self: Box<Self>) -> Result<Box<dyn Container>> {
        let inner = self.core.take_inner()?;
        let container = inner.into_container()?;
        Ok(Box::new(DelayedDisposalContainer {
            core: self.core.sibling(container, self.core.shadow),
        }))
    }

    fn persist(&self) -> Result<Vec<u8>> {
        self.core.persist(persist::DELAYED_BUFFER_MAGIC, |inner| inner.persist())
    }

    fn name(&self) -> String {
        match self.core.peek(|inner| inner.name()) {
            Some(name) => format!("delayed({})", name),
            None => format!("delayed({})", self.core.identity),
        }
    }

    fn kind(&self) -> ContainerKind {
        ContainerKind::DelayedDisposal
    }
}
