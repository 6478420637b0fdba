//! Source-loss debouncing.
//!
//! A source only counts as lost once it has been offline or unknown for a
//! full expired-wait window, and sources that drop out close together are
//! batched into a single notification. Each [`TerminationSet`] groups sources
//! that share one expiration deadline.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::RemoteSourceHandle;
use crate::util::Timer;

/// A source reported offline or unknown on this tick.
#[derive(Debug, Clone)]
pub(crate) struct OfflineSource {
    pub handle: RemoteSourceHandle,
    pub name: String,
    pub terminated: bool,
}

/// A member of a termination set.
#[derive(Debug, Clone)]
struct SetMember {
    name: String,
    terminated: bool,
}

/// Sources sharing a common loss deadline.
pub(crate) struct TerminationSet {
    expiry: Timer,
    members: BTreeMap<RemoteSourceHandle, SetMember>,
}

/// A source collected by [`get_expired_sources`].
#[derive(Debug, Clone)]
pub(crate) struct ExpiredSource {
    pub handle: RemoteSourceHandle,
    pub name: String,
    pub terminated: bool,
}

/// Ensures every offline source belongs to a termination set, creating a new
/// set dated `now + expired_wait` when none contains it.
///
/// A freshly offline source joins the newest set that is still in the first
/// half of its window, so near-simultaneous dropouts batch into a single
/// notification without starving that set's deadline. Unknown sources keep
/// their existing membership (their `terminated` state may still update).
pub(crate) fn mark_sources_offline(
    offline: &[OfflineSource],
    unknown: &[OfflineSource],
    sets: &mut Vec<TerminationSet>,
    expired_wait: Duration,
) {
    for source in offline {
        if sets.iter().any(|set| set.members.contains_key(&source.handle)) {
            if let Some(member) = find_member(sets, source.handle) {
                member.terminated = source.terminated;
            }
            continue;
        }

        let member = SetMember { name: source.name.clone(), terminated: source.terminated };
        let join_newest = sets.last().is_some_and(|set| {
            !set.expiry.is_expired() && set.expiry.elapsed() * 2 < set.expiry.interval()
        });
        if join_newest {
            let set = sets.last_mut().expect("nonempty when joinable");
            set.members.insert(source.handle, member);
        } else {
            let mut members = BTreeMap::new();
            members.insert(source.handle, member);
            sets.push(TerminationSet { expiry: Timer::new(expired_wait), members });
        }
    }

    for source in unknown {
        if let Some(member) = find_member(sets, source.handle) {
            member.terminated = source.terminated;
        }
    }
}

/// Removes sources that came back online from every set; empty sets are
/// dropped. A source that bounces offline and back before its deadline never
/// produces a notification.
pub(crate) fn mark_sources_online(
    online: &[RemoteSourceHandle],
    sets: &mut Vec<TerminationSet>,
) {
    for handle in online {
        for set in sets.iter_mut() {
            set.members.remove(handle);
        }
    }
    sets.retain(|set| !set.members.is_empty());
}

/// Drains every set whose deadline has passed, returning the lost sources.
pub(crate) fn get_expired_sources(sets: &mut Vec<TerminationSet>) -> Vec<ExpiredSource> {
    let mut expired = Vec::new();
    sets.retain_mut(|set| {
        if !set.expiry.is_expired() {
            return true;
        }
        for (handle, member) in std::mem::take(&mut set.members) {
            expired.push(ExpiredSource {
                handle,
                name: member.name,
                terminated: member.terminated,
            });
        }
        false
    });
    expired
}

fn find_member(
    sets: &mut [TerminationSet],
    handle: RemoteSourceHandle,
) -> Option<&mut SetMember> {
    sets.iter_mut().find_map(|set| set.members.get_mut(&handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(value: u16) -> RemoteSourceHandle {
        RemoteSourceHandle::new(value).unwrap()
    }

    fn offline(value: u16, terminated: bool) -> OfflineSource {
        OfflineSource { handle: handle(value), name: format!("source {value}"), terminated }
    }

    #[test]
    fn source_not_lost_before_deadline() {
        let mut sets = Vec::new();
        mark_sources_offline(&[offline(1, false)], &[], &mut sets, Duration::from_millis(50));
        assert!(get_expired_sources(&mut sets).is_empty());
        assert_eq!(sets.len(), 1);
    }

    #[test]
    fn source_lost_after_deadline() {
        let mut sets = Vec::new();
        mark_sources_offline(&[offline(1, true)], &[], &mut sets, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));

        let expired = get_expired_sources(&mut sets);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, handle(1));
        assert!(expired[0].terminated);
        assert!(sets.is_empty());
    }

    #[test]
    fn bounce_back_online_cancels_loss() {
        let mut sets = Vec::new();
        mark_sources_offline(&[offline(1, false)], &[], &mut sets, Duration::from_millis(5));
        mark_sources_online(&[handle(1)], &mut sets);
        std::thread::sleep(Duration::from_millis(10));
        assert!(get_expired_sources(&mut sets).is_empty());
        assert!(sets.is_empty());
    }

    #[test]
    fn simultaneous_losses_batch_into_one_set() {
        let mut sets = Vec::new();
        mark_sources_offline(
            &[offline(1, false), offline(2, false)],
            &[],
            &mut sets,
            Duration::from_millis(50),
        );
        mark_sources_offline(&[offline(3, false)], &[], &mut sets, Duration::from_millis(50));
        assert_eq!(sets.len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        let expired = get_expired_sources(&mut sets);
        assert_eq!(expired.len(), 3);
    }

    #[test]
    fn late_dropout_gets_its_own_set() {
        let mut sets = Vec::new();
        mark_sources_offline(&[offline(1, false)], &[], &mut sets, Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(15));
        // Past half the window; a new dropout must not delay behind set 1.
        mark_sources_offline(&[offline(2, false)], &[], &mut sets, Duration::from_millis(20));
        assert_eq!(sets.len(), 2);

        std::thread::sleep(Duration::from_millis(10));
        let expired = get_expired_sources(&mut sets);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, handle(1));
    }

    #[test]
    fn unknown_keeps_membership_and_updates_termination() {
        let mut sets = Vec::new();
        mark_sources_offline(&[offline(1, false)], &[], &mut sets, Duration::from_millis(5));
        mark_sources_offline(&[], &[offline(1, true)], &mut sets, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));

        let expired = get_expired_sources(&mut sets);
        assert_eq!(expired.len(), 1);
        assert!(expired[0].terminated);
    }
}
