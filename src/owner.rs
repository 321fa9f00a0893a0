
/// The identity of an execution context, used to decide whether a lock
/// acquisition is a re-entry by the current holder.
///
/// [`OwnerId::NONE`] is reserved for "no owner"; [`OwnerId::current`] never
/// returns it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct OwnerId(usize);

impl OwnerId {
    /// The id stored in a lock that is not currently held.
    pub(crate) const NONE: Self = Self(0);

    /// Returns the id of the current execution context.
    ///
    /// The id is the address of a thread-local, so it is stable for the
    /// lifetime of the thread and distinct from the id of every other live
    /// thread. Two threads can observe the same id only if the termination of
    /// one happens before the start of the other, in which case they can
    /// never contend for a lock and treating them as one context is sound.
    #[inline(always)]
    pub(crate) fn current() -> Self {
        thread_local!(static OWNER_ANCHOR: u8 = const { 0 });
        OWNER_ANCHOR.with(|anchor| {
            let anchor: *const u8 = anchor;
            Self(anchor as usize)
        })
    }
}
