use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::{
    providers::{CandidateList, ReasonTag},
    scoring::{self, OwnerContext, ScoringConfig},
    types::{rank_order, FeedEntry, FeedPreferences},
};

/// Merge provider outputs into a ranked, bounded entry list.
///
/// Candidates violating `preferences` are dropped before scoring. Duplicates
/// keep their highest score, and the reason of whichever list produced it;
/// on equal scores the earlier list wins. The result follows `rank_order`
/// and holds at most `max_entries` entries.
pub fn assemble(
    lists: &[CandidateList],
    preferences: &FeedPreferences,
    ctx: &OwnerContext,
    config: &ScoringConfig,
    max_entries: usize,
) -> Vec<FeedEntry> {
    let mut best: HashMap<&str, FeedEntry> = HashMap::new();

    for list in lists {
        for post in list
            .posts
            .iter()
            .filter(|post| preferences.admits(post, ctx.now))
        {
            let breakdown = scoring::breakdown(post, ctx, config);
            let score = breakdown.total();
            let reason = match list.tag {
                ReasonTag::Fixed(reason) => reason,
                ReasonTag::DominantFactor => breakdown.dominant_reason(),
            };

            let candidate = FeedEntry {
                post_id: post.id.clone(),
                author_id: post.author_id.clone(),
                score,
                reason,
                created_at: post.created_at,
                added_at: ctx.now,
            };

            match best.entry(post.id.as_str()) {
                Entry::Occupied(mut held) => {
                    if candidate.score > held.get().score {
                        held.insert(candidate);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
            }
        }
    }

    let mut entries: Vec<FeedEntry> = best.into_values().collect();
    entries.sort_by(rank_order);
    entries.truncate(max_entries);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InterestProfile, KarmaLevel, PostSnapshot, Reason};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::cmp::Ordering;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn post(id: &str, author: &str, reactions: u64, age_hours: i64) -> PostSnapshot {
        PostSnapshot {
            id: id.to_string(),
            author_id: author.to_string(),
            created_at: now() - Duration::hours(age_hours),
            reactions_count: reactions,
            comment_count: 0,
            share_count: 0,
            category_id: None,
            topic_id: None,
            hashtags: vec![],
            author_karma_level: KarmaLevel::Contributor,
            reply_to: None,
            repost_of: None,
        }
    }

    fn ctx(followees: &[&str]) -> OwnerContext {
        OwnerContext {
            owner_id: "alice".to_string(),
            active_followees: followees.iter().map(|f| f.to_string()).collect::<HashSet<_>>(),
            profile: InterestProfile::default(),
            now: now(),
        }
    }

    fn list(provider: &'static str, reason: Reason, posts: Vec<PostSnapshot>) -> CandidateList {
        CandidateList {
            provider,
            tag: ReasonTag::Fixed(reason),
            posts,
        }
    }

    #[test]
    fn test_deduplicates_keeping_first_reason_on_tie() {
        let shared = post("p1", "bob", 10, 1);
        let lists = vec![
            list("following", Reason::Following, vec![shared.clone()]),
            list("trending", Reason::Trending, vec![shared, post("p2", "carol", 3, 2)]),
        ];

        let entries = assemble(
            &lists,
            &FeedPreferences::default(),
            &ctx(&["bob"]),
            &ScoringConfig::default(),
            100,
        );
        assert_eq!(entries.len(), 2);
        let p1 = entries.iter().find(|e| e.post_id == "p1").unwrap();
        assert_eq!(p1.reason, Reason::Following);
    }

    #[test]
    fn test_higher_scoring_duplicate_wins_reason() {
        // The trending copy carries fresher engagement counts.
        let lists = vec![
            list("following", Reason::Following, vec![post("p1", "bob", 0, 1)]),
            list("trending", Reason::Trending, vec![post("p1", "bob", 80, 1)]),
        ];
        let entries = assemble(
            &lists,
            &FeedPreferences::default(),
            &ctx(&[]),
            &ScoringConfig::default(),
            100,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, Reason::Trending);
    }

    #[test]
    fn test_more_reactions_rank_first_in_trending() {
        let lists = vec![list(
            "trending",
            Reason::Trending,
            vec![post("quiet", "bob", 5, 3), post("popular", "bob", 100, 3)],
        )];
        let entries = assemble(
            &lists,
            &FeedPreferences::default(),
            &ctx(&[]),
            &ScoringConfig::default(),
            100,
        );
        assert_eq!(entries[0].post_id, "popular");
        assert!(entries[0].score > entries[1].score);
    }

    #[test]
    fn test_preferences_filter_candidates() {
        let mut reply = post("reply", "bob", 1, 1);
        reply.reply_to = Some("root".to_string());
        let mut low_karma = post("newbie", "carol", 1, 1);
        low_karma.author_karma_level = KarmaLevel::Newbie;
        let lists = vec![list(
            "trending",
            Reason::Trending,
            vec![
                reply,
                low_karma,
                post("old", "dave", 1, 24 * 30),
                post("muted", "mallory", 1, 1),
                post("kept", "erin", 1, 1),
            ],
        )];

        let mut prefs = FeedPreferences {
            include_replies: false,
            min_karma_level: KarmaLevel::Apprentice,
            ..FeedPreferences::default()
        };
        prefs.excluded_users.insert("mallory".to_string());

        let entries = assemble(&lists, &prefs, &ctx(&[]), &ScoringConfig::default(), 100);
        let ids: Vec<_> = entries.iter().map(|e| e.post_id.as_str()).collect();
        assert_eq!(ids, vec!["kept"]);
    }

    #[test]
    fn test_output_is_ordered_and_bounded() {
        let posts: Vec<_> = (0..40)
            .map(|i| {
                post(&format!("p{:02}", i), &format!("u{}", i % 7), (i * 13 % 17) as u64, i % 5)
            })
            .collect();
        let lists = vec![list("trending", Reason::Trending, posts)];

        let entries = assemble(
            &lists,
            &FeedPreferences::default(),
            &ctx(&["u1"]),
            &ScoringConfig::default(),
            25,
        );
        assert_eq!(entries.len(), 25);
        assert!(entries
            .windows(2)
            .all(|w| rank_order(&w[0], &w[1]) == Ordering::Less));
        let unique: HashSet<_> = entries.iter().map(|e| e.post_id.as_str()).collect();
        assert_eq!(unique.len(), 25);
    }

    #[test]
    fn test_dominant_factor_labels_discover_entries() {
        let lists = vec![CandidateList {
            provider: "discover",
            tag: ReasonTag::DominantFactor,
            posts: vec![post("viral", "zed", 1_000, 24 * 5)],
        }];
        let entries = assemble(
            &lists,
            &FeedPreferences::default(),
            &ctx(&[]),
            &ScoringConfig::default(),
            10,
        );
        assert_eq!(entries[0].reason, Reason::Engagement);
    }
}
