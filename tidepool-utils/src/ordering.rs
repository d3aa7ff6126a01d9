use std::sync::atomic::Ordering;

/// Compile-time memory-ordering policy.
///
/// Containers take a `MemoryModel` as part of their traits bundle and feed
/// its constants to every atomic operation on their linkage fields. The
/// [`RelaxedModel`] policy is the algorithmically required minimum; the
/// [`SeqCstModel`] policy runs everything sequentially consistent, which is
/// the easier regime to reason about when debugging an interleaving.
pub trait MemoryModel: 'static {
    /// Ordering for plain loads of linkage fields.
    const LOAD: Ordering;
    /// Ordering for plain stores of linkage fields.
    const STORE: Ordering;
    /// Success ordering for read-modify-write operations.
    const RMW_SUCCESS: Ordering;
    /// Failure ordering for compare-exchange operations.
    const RMW_FAILURE: Ordering;
}

/// Acquire/release orderings: loads acquire, stores release, successful
/// read-modify-writes acquire-release, failed compare-exchanges relaxed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelaxedModel;

impl MemoryModel for RelaxedModel {
    const LOAD: Ordering = Ordering::Acquire;
    const STORE: Ordering = Ordering::Release;
    const RMW_SUCCESS: Ordering = Ordering::AcqRel;
    const RMW_FAILURE: Ordering = Ordering::Relaxed;
}

/// Sequentially consistent orderings for every operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeqCstModel;

impl MemoryModel for SeqCstModel {
    const LOAD: Ordering = Ordering::SeqCst;
    const STORE: Ordering = Ordering::SeqCst;
    const RMW_SUCCESS: Ordering = Ordering::SeqCst;
    const RMW_FAILURE: Ordering = Ordering::SeqCst;
}

/// Derives a store ordering from a combined ordering.
///
/// Used when an operation only stores but the caller passed an ordering
/// meant for a read-modify-write: `Acquire` weakens to `Relaxed`, `AcqRel`
/// to `Release`, everything else is unchanged.
#[inline]
pub fn store_order(ord: Ordering) -> Ordering {
    match ord {
        Ordering::Acquire => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Release,
        ord => ord,
    }
}

/// Derives a load ordering from a combined ordering.
///
/// `Release` weakens to `Relaxed`, `AcqRel` to `Acquire`, everything else
/// is unchanged.
#[inline]
pub fn load_order(ord: Ordering) -> Ordering {
    match ord {
        Ordering::Release => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Acquire,
        ord => ord,
    }
}

/// Returns the strongest failure ordering legal for a compare-exchange with
/// the given success ordering.
#[inline]
pub fn failure_order(ord: Ordering) -> Ordering {
    match ord {
        Ordering::Relaxed | Ordering::Release => Ordering::Relaxed,
        Ordering::Acquire | Ordering::AcqRel => Ordering::Acquire,
        _ => Ordering::SeqCst,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::*;

    #[test]
    fn store_order_weakens_loads() {
        assert_eq!(store_order(Acquire), Relaxed);
        assert_eq!(store_order(AcqRel), Release);
        assert_eq!(store_order(SeqCst), SeqCst);
        assert_eq!(store_order(Release), Release);
    }

    #[test]
    fn load_order_weakens_stores() {
        assert_eq!(load_order(Release), Relaxed);
        assert_eq!(load_order(AcqRel), Acquire);
        assert_eq!(load_order(SeqCst), SeqCst);
        assert_eq!(load_order(Acquire), Acquire);
    }

    #[test]
    fn failure_order_is_legal() {
        assert_eq!(failure_order(Release), Relaxed);
        assert_eq!(failure_order(AcqRel), Acquire);
        assert_eq!(failure_order(SeqCst), SeqCst);
    }
}
