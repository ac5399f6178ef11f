// ── kmem: Retrieval Policy ──────────────────────────────────────────────────
//
// Turns a shortlist of decrypted candidates into the memories worth surfacing:
//
//   1. shortlist N = max_results × overfetch_factor (LocalSearch / FallbackSearch)
//   2. drop sensitive items unless the caller opted in
//   3. drop items still cooling down
//   4. relevance floor on raw similarity; relevance = sim + w·salience
//   5. MMR diversity (optional): penalize similarity to already-picked items
//   6. recent-reuse penalty (demotes, never excludes)
//   7. truncate to max_results
//
// Usage recording happens afterwards, in the worker, for whatever survives.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Candidate, RecallOptions, RecalledMemory, SearchStrategy};
use crate::engine::ann::distance::cosine_similarity;
use crate::engine::config::RetrievalConfig;
use crate::engine::crypto::CryptoModule;
use crate::engine::store::MemoryStore;

/// Candidates plus whether the local index had to be bypassed.
#[derive(Debug)]
pub struct Shortlist {
    pub candidates: Vec<Candidate>,
    /// LocalFirst hit an index error and used the scan instead.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
struct Scored {
    candidate: Candidate,
    relevance: f32,
}

pub struct RetrievalEngine {
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn max_results(&self, opts: &RecallOptions) -> usize {
        opts.max_results.unwrap_or(self.config.max_results)
    }

    /// Over-fetch so filtering still leaves enough to choose from.
    pub fn shortlist_size(&self, opts: &RecallOptions) -> usize {
        let max = self.max_results(opts);
        max.saturating_mul(self.config.overfetch_factor.max(1))
            .max(max.saturating_add(1))
    }

    /// Cooldown applied to each surfaced item.
    pub fn cooldown(&self) -> Duration {
        Duration::minutes(self.config.cooldown_minutes.max(0))
    }

    // ── Candidate sourcing ─────────────────────────────────────────────

    pub fn shortlist(
        &self,
        store: &MemoryStore,
        crypto: &CryptoModule,
        owner_id: &str,
        query: &[f32],
        opts: &RecallOptions,
    ) -> EngineResult<Shortlist> {
        let n = self.shortlist_size(opts);
        let scan = || store.scan_candidates(crypto, owner_id, query, self.config.fallback_scan_limit.max(n));

        match opts.strategy {
            SearchStrategy::LocalOnly => Ok(Shortlist {
                candidates: store.get_candidates(crypto, owner_id, query, n)?,
                degraded: false,
            }),
            SearchStrategy::FallbackOnly => Ok(Shortlist {
                candidates: scan()?,
                degraded: false,
            }),
            SearchStrategy::LocalFirst => match store.get_candidates(crypto, owner_id, query, n) {
                Ok(candidates) => Ok(Shortlist {
                    candidates,
                    degraded: false,
                }),
                // Key and dimension errors are the caller's problem.
                Err(e @ (EngineError::Crypto(_) | EngineError::DimensionMismatch { .. })) => Err(e),
                Err(e) => {
                    warn!("[kmem-retrieval] Local search failed, scanning instead: {}", e);
                    Ok(Shortlist {
                        candidates: scan()?,
                        degraded: true,
                    })
                }
            },
        }
    }

    // ── Policy ─────────────────────────────────────────────────────────

    /// Filter and rank `candidates`. Pure: no I/O, no clock reads.
    pub fn select(
        &self,
        candidates: Vec<Candidate>,
        opts: &RecallOptions,
        now: DateTime<Utc>,
    ) -> Vec<RecalledMemory> {
        let max_results = self.max_results(opts);
        if max_results == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let floor = opts.min_relevance.unwrap_or(self.config.min_relevance);
        let total = candidates.len();

        let pool: Vec<Scored> = candidates
            .into_iter()
            .filter(|c| opts.include_sensitive || !c.item.sensitive)
            .filter(|c| !c.item.is_cooling_down(now))
            .filter(|c| c.similarity >= floor)
            .map(|c| Scored {
                relevance: c.similarity + self.config.salience_weight * c.item.salience.clamp(0.0, 1.0),
                candidate: c,
            })
            .collect();

        let mut ranked = if opts.diversity > 0.0 {
            mmr(pool, opts.diversity, floor)
        } else {
            pool
        };

        if let Some(window) = opts.penalize_recent_reuse_minutes {
            let since = now - Duration::minutes(window.max(0));
            for s in &mut ranked {
                if s.candidate.item.last_used_at.is_some_and(|t| t > since && t <= now) {
                    s.relevance -= self.config.reuse_penalty;
                }
            }
        }

        ranked.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| a.candidate.item.id.cmp(&b.candidate.item.id))
        });
        ranked.truncate(max_results);

        debug!(
            "[kmem-retrieval] {} candidates → {} selected (diversity {:.2})",
            total,
            ranked.len(),
            opts.diversity
        );
        ranked
            .into_iter()
            .map(|s| RecalledMemory {
                similarity: s.candidate.similarity,
                score: s.relevance,
                item: s.candidate.item,
            })
            .collect()
    }
}

/// Greedy maximal marginal relevance. Each pick takes the candidate with the
/// best `relevance - diversity × max cos(candidate, picked)`; its score becomes
/// that marginal value. Anything whose marginal score sinks below `floor` is
/// dropped.
fn mmr(mut remaining: Vec<Scored>, diversity: f32, floor: f32) -> Vec<Scored> {
    let mut picked: Vec<Scored> = Vec::with_capacity(remaining.len());
    // Current marginal score of each remaining candidate.
    let mut marginal: Vec<f32> = remaining.iter().map(|s| s.relevance).collect();
    let mut max_sim: Vec<f32> = vec![0.0; remaining.len()];

    while !remaining.is_empty() {
        let best = (0..remaining.len()).max_by(|&a, &b| {
            marginal[a]
                .total_cmp(&marginal[b])
                .then_with(|| remaining[b].candidate.item.id.cmp(&remaining[a].candidate.item.id))
        });
        let Some(best) = best else { break };

        let mut chosen = remaining.swap_remove(best);
        chosen.relevance = marginal.swap_remove(best);
        max_sim.swap_remove(best);

        for i in 0..remaining.len() {
            let sim = cosine_similarity(
                &remaining[i].candidate.item.embedding,
                &chosen.candidate.item.embedding,
            );
            max_sim[i] = max_sim[i].max(sim);
            marginal[i] = remaining[i].relevance - diversity * max_sim[i];
        }
        picked.push(chosen);

        // Drop everything the penalty pushed under the floor.
        let mut i = 0;
        while i < remaining.len() {
            if marginal[i] < floor {
                remaining.swap_remove(i);
                marginal.swap_remove(i);
                max_sim.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{CandidateSource, MemoryItem, MemoryType};

    fn candidate(id: &str, embedding: [f32; 4], similarity: f32) -> Candidate {
        let now = Utc::now();
        Candidate {
            item: MemoryItem {
                id: id.into(),
                owner_id: "u1".into(),
                memory_type: MemoryType::Fact,
                content: format!("memory {id}"),
                embedding: embedding.to_vec(),
                salience: 0.5,
                sensitive: false,
                usage_count: 0,
                last_used_at: None,
                cooldown_until: None,
                topic_tags: Default::default(),
                source: "user".into(),
                created_at: now,
                updated_at: now,
            },
            similarity,
            source: CandidateSource::LocalSearch,
        }
    }

    fn engine() -> RetrievalEngine {
        RetrievalEngine::new(RetrievalConfig::default())
    }

    fn ids(recalled: &[RecalledMemory]) -> Vec<&str> {
        recalled.iter().map(|r| r.item.id.as_str()).collect()
    }

    #[test]
    fn shortlist_overfetches() {
        let e = engine();
        assert_eq!(e.shortlist_size(&RecallOptions::default()), 20);
        assert_eq!(e.shortlist_size(&RecallOptions::limit(1)), 4);
        assert_eq!(e.shortlist_size(&RecallOptions::limit(0)), 1);
    }

    #[test]
    fn ranks_by_similarity_plus_salience() {
        let mut low = candidate("low", [0.0, 1.0, 0.0, 0.0], 0.60);
        low.item.salience = 1.0;
        let high = candidate("high", [1.0, 0.0, 0.0, 0.0], 0.62);
        let out = engine().select(vec![high, low], &RecallOptions::default(), Utc::now());
        // 0.60 + 0.1 beats 0.62 + 0.05
        assert_eq!(ids(&out), vec!["low", "high"]);
        assert!((out[0].score - 0.70).abs() < 1e-6);
    }

    #[test]
    fn sensitive_items_need_opt_in() {
        let mut secret = candidate("secret", [1.0, 0.0, 0.0, 0.0], 0.9);
        secret.item.sensitive = true;
        let plain = candidate("plain", [0.0, 1.0, 0.0, 0.0], 0.5);
        let e = engine();

        let out = e.select(vec![secret.clone(), plain.clone()], &RecallOptions::default(), Utc::now());
        assert_eq!(ids(&out), vec!["plain"]);

        let opts = RecallOptions {
            include_sensitive: true,
            ..Default::default()
        };
        let out = e.select(vec![secret, plain], &opts, Utc::now());
        assert_eq!(ids(&out), vec!["secret", "plain"]);
    }

    #[test]
    fn cooldown_excludes_until_it_expires() {
        let now = Utc::now();
        let mut c = candidate("a", [1.0, 0.0, 0.0, 0.0], 0.9);
        c.item.cooldown_until = Some(now + Duration::minutes(10));
        let e = engine();

        assert!(e.select(vec![c.clone()], &RecallOptions::default(), now).is_empty());
        let later = now + Duration::minutes(10);
        assert_eq!(ids(&e.select(vec![c], &RecallOptions::default(), later)), vec!["a"]);
    }

    #[test]
    fn relevance_floor_drops_weak_matches() {
        let weak = candidate("weak", [1.0, 0.0, 0.0, 0.0], 0.05);
        let ok = candidate("ok", [0.0, 1.0, 0.0, 0.0], 0.3);
        let e = engine();
        assert_eq!(ids(&e.select(vec![weak.clone(), ok.clone()], &RecallOptions::default(), Utc::now())), vec!["ok"]);

        let opts = RecallOptions {
            min_relevance: Some(0.5),
            ..Default::default()
        };
        assert!(e.select(vec![weak, ok], &opts, Utc::now()).is_empty());
    }

    #[test]
    fn diversity_prefers_distinct_memories() {
        let a = candidate("a", [1.0, 0.0, 0.0, 0.0], 0.95);
        let near_a = candidate("near-a", [0.99, 0.1, 0.0, 0.0], 0.94);
        let b = candidate("b", [0.0, 1.0, 0.0, 0.0], 0.60);
        let e = engine();

        let plain = e.select(vec![a.clone(), near_a.clone(), b.clone()], &RecallOptions::limit(2), Utc::now());
        assert_eq!(ids(&plain), vec!["a", "near-a"]);

        let opts = RecallOptions {
            diversity: 0.5,
            ..RecallOptions::limit(2)
        };
        let diverse = e.select(vec![a, near_a, b], &opts, Utc::now());
        assert_eq!(ids(&diverse), vec!["a", "b"]);
        assert!(diverse[0].score >= diverse[1].score);
    }

    #[test]
    fn heavy_diversity_drops_near_duplicates() {
        let a = candidate("a", [1.0, 0.0, 0.0, 0.0], 0.5);
        let dup = candidate("dup", [1.0, 0.0, 0.0, 0.0], 0.5);
        let opts = RecallOptions {
            diversity: 1.0,
            ..Default::default()
        };
        let out = engine().select(vec![a, dup], &opts, Utc::now());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn recent_reuse_demotes_without_excluding() {
        let now = Utc::now();
        let mut used = candidate("used", [1.0, 0.0, 0.0, 0.0], 0.80);
        used.item.last_used_at = Some(now - Duration::minutes(5));
        let fresh = candidate("fresh", [0.0, 1.0, 0.0, 0.0], 0.75);
        let e = engine();

        let out = e.select(vec![used.clone(), fresh.clone()], &RecallOptions::default(), now);
        assert_eq!(ids(&out), vec!["used", "fresh"]);

        let opts = RecallOptions {
            penalize_recent_reuse_minutes: Some(60),
            ..Default::default()
        };
        let out = e.select(vec![used, fresh], &opts, now);
        assert_eq!(ids(&out), vec!["fresh", "used"]);
    }

    #[test]
    fn truncates_to_max_results() {
        let cs = (0..10)
            .map(|i| candidate(&format!("m{i}"), [1.0, i as f32, 0.0, 0.0], 0.9 - i as f32 * 0.01))
            .collect();
        let out = engine().select(cs, &RecallOptions::limit(3), Utc::now());
        assert_eq!(ids(&out), vec!["m0", "m1", "m2"]);
    }

    mod sourcing {
        use super::*;
        use crate::engine::config::EngineConfig;

        fn seeded() -> (MemoryStore, CryptoModule) {
            let config = EngineConfig::in_memory(4);
            let store = MemoryStore::open(&config).unwrap();
            let mut crypto = CryptoModule::new(&config.crypto);
            crypto.setup_with_passphrase("pw").unwrap();
            for c in [
                candidate("a", [1.0, 0.0, 0.0, 0.0], 0.0),
                candidate("b", [0.0, 1.0, 0.0, 0.0], 0.0),
            ] {
                store.put(&crypto, &c.item).unwrap();
            }
            (store, crypto)
        }

        #[test]
        fn fallback_only_scans() {
            let (store, crypto) = seeded();
            let opts = RecallOptions {
                strategy: SearchStrategy::FallbackOnly,
                ..Default::default()
            };
            let list = engine()
                .shortlist(&store, &crypto, "u1", &[0.0, 1.0, 0.0, 0.0], &opts)
                .unwrap();
            assert!(!list.degraded);
            assert_eq!(list.candidates[0].item.id, "b");
            assert_eq!(list.candidates[0].source, CandidateSource::FallbackSearch);
        }

        #[test]
        fn local_first_falls_back_on_drift() {
            let (store, crypto) = seeded();
            store
                .conn
                .lock()
                .execute("DELETE FROM memory_items WHERE id = 'a'", [])
                .unwrap();

            let e = engine();
            let query = [1.0, 0.0, 0.0, 0.0];
            let local_only = RecallOptions {
                strategy: SearchStrategy::LocalOnly,
                ..Default::default()
            };
            assert!(e.shortlist(&store, &crypto, "u1", &query, &local_only).is_err());

            let list = e
                .shortlist(&store, &crypto, "u1", &query, &RecallOptions::default())
                .unwrap();
            assert!(list.degraded);
            assert_eq!(list.candidates.len(), 1);
            assert_eq!(list.candidates[0].item.id, "b");
        }

        #[test]
        fn local_first_scans_when_index_is_not_built() {
            let (store, crypto) = seeded();
            store.clear_index();
            let list = engine()
                .shortlist(&store, &crypto, "u1", &[1.0, 0.0, 0.0, 0.0], &RecallOptions::default())
                .unwrap();
            assert!(list.degraded);
            assert_eq!(list.candidates.len(), 2);
            assert_eq!(list.candidates[0].item.id, "a");
        }

        #[test]
        fn dimension_errors_propagate() {
            let (store, crypto) = seeded();
            let err = engine()
                .shortlist(&store, &crypto, "u1", &[1.0], &RecallOptions::default())
                .unwrap_err();
            assert!(matches!(err, EngineError::DimensionMismatch { .. }));
        }
    }
}
