//! Property-based tests for message ordering.
//!
//! The message log is the single source of truth for ordering: regardless
//! of how posts from different authors and rooms interleave, each room's
//! ids must come out strictly increasing, gapless, and duplicate-free.

use std::collections::{BTreeMap, HashMap};

use chorus_server::{RoomBroadcaster, stores::{MembershipStore, MemoryStore}};
use proptest::prelude::*;

fn arbitrary_post() -> impl Strategy<Value = (u64, u64, String)> {
    // Small id spaces force interleaving across shared rooms
    (1u64..=4, 1u64..=6, "[a-z]{1,16}").prop_map(|(room, author, body)| (room, author, body))
}

proptest! {
    #[test]
    fn interleaved_posts_yield_gapless_increasing_ids(
        posts in prop::collection::vec(arbitrary_post(), 1..60)
    ) {
        let store = MemoryStore::new();
        for (room_id, author_id, _) in &posts {
            store.add_member(*room_id, *author_id).unwrap();
        }
        let broadcaster = RoomBroadcaster::new(store);

        let mut seen: HashMap<u64, Vec<u64>> = HashMap::new();
        for (room_id, author_id, body) in &posts {
            let message = broadcaster
                .post_message(*room_id, *author_id, body, 0)
                .unwrap();
            seen.entry(*room_id).or_default().push(message.message_id);
        }

        for (room_id, ids) in &seen {
            // Strictly increasing and gapless from 1
            for (index, id) in ids.iter().enumerate() {
                prop_assert_eq!(*id, index as u64 + 1);
            }

            prop_assert_eq!(
                broadcaster.latest_message_id(*room_id).unwrap(),
                Some(ids.len() as u64)
            );
        }
    }

    #[test]
    fn sync_reads_back_exactly_what_was_posted(
        // First character is never whitespace so no body trims to empty
        bodies in prop::collection::vec("[a-z][a-z ]{0,23}", 1..40),
        page_size in 1u32..10,
    ) {
        let store = MemoryStore::new();
        store.add_member(7, 1).unwrap();
        let broadcaster = RoomBroadcaster::new(store);

        for body in &bodies {
            broadcaster.post_message(7, 1, body, 0).unwrap();
        }

        // Walk the log page by page; the concatenation must equal the
        // original sequence with ascending ids
        let mut collected = Vec::new();
        let mut cursor = 0;
        loop {
            let page = broadcaster.handle_sync_request(7, 1, cursor, page_size).unwrap();
            let more = page.has_more;

            if let Some(last) = page.messages.last() {
                cursor = last.message_id;
            }
            collected.extend(page.messages);

            if !more {
                break;
            }
        }

        prop_assert_eq!(collected.len(), bodies.len());
        for (index, message) in collected.iter().enumerate() {
            prop_assert_eq!(message.message_id, index as u64 + 1);
            prop_assert_eq!(&message.body, &bodies[index]);
        }
    }

    #[test]
    fn merging_pushes_with_pull_pages_dedups_and_sorts(
        bodies in prop::collection::vec("[a-z]{1,12}", 1..40),
        drop_mask in prop::collection::vec(any::<bool>(), 40),
        page_size in 1u32..8,
    ) {
        let store = MemoryStore::new();
        store.add_member(3, 1).unwrap();
        let broadcaster = RoomBroadcaster::new(store);

        // Pushes a flaky client kept: every posted row minus the dropped ones
        let mut pushed = Vec::new();
        for (index, body) in bodies.iter().enumerate() {
            let message = broadcaster.post_message(3, 1, body, 0).unwrap();
            if !drop_mask[index] {
                pushed.push(message);
            }
        }

        // Client-side merge by message_id: pushes first, then every pull page
        let mut merged = BTreeMap::new();
        for message in pushed {
            merged.insert(message.message_id, message);
        }

        let mut cursor = 0;
        loop {
            let page = broadcaster.handle_sync_request(3, 1, cursor, page_size).unwrap();
            let more = page.has_more;

            if let Some(last) = page.messages.last() {
                cursor = last.message_id;
            }
            for message in page.messages {
                // A pull row for an id the push path already delivered must
                // be the same row
                if let Some(existing) = merged.insert(message.message_id, message.clone()) {
                    prop_assert_eq!(existing, message);
                }
            }

            if !more {
                break;
            }
        }

        // Duplicate-free, ascending, and gapless regardless of which pushes
        // were lost
        prop_assert_eq!(merged.len(), bodies.len());
        for (index, (&id, message)) in merged.iter().enumerate() {
            prop_assert_eq!(id, index as u64 + 1);
            prop_assert_eq!(message.message_id, id);
            prop_assert_eq!(&message.body, &bodies[index]);
        }
    }
}
