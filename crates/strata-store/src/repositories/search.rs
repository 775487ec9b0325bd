//! Search repository: hybrid lexical + vector search over the graph.
//!
//! The lexical leg ranks FTS5 matches by `bm25`. The vector leg ranks
//! stored embeddings by cosine similarity to the query vector (brute force;
//! the graphs this store targets are small). The two rankings are combined
//! with reciprocal-rank fusion.

use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use strata_core::vector::{cosine_similarity, from_blob};

use super::community::{self, map_community};
use super::entity::{self, map_entity};
use super::episode::{self, map_episode};
use super::fact::{self, map_fact, temporal_clause};
use super::{in_clause, text_values};
use crate::errors::Result;
use crate::types::{SearchHits, SearchRequest};

/// Rank constant for reciprocal-rank fusion.
///
/// With `k = 1` a top hit in one leg scores 0.5 and a top hit in both legs
/// scores 1.0, the scale the fixed expansion scores are set against.
pub const RRF_K: f64 = 1.0;

/// How many candidates each leg contributes per requested result.
const CANDIDATE_FACTOR: usize = 3;

/// A searchable table and its FTS shadow.
struct Target {
    table: &'static str,
    fts: &'static str,
}

const EPISODES: Target = Target { table: "episodes", fts: "episodes_fts" };
const ENTITIES: Target = Target { table: "entities", fts: "entities_fts" };
const FACTS: Target = Target { table: "facts", fts: "facts_fts" };
const COMMUNITIES: Target = Target { table: "communities", fts: "communities_fts" };

/// Extra predicate on alias `t`, with its bound values.
#[derive(Default)]
struct Filter {
    sql: String,
    values: Vec<Value>,
}

impl Filter {
    fn and(mut self, clause: &str, values: Vec<Value>) -> Self {
        self.sql.push_str(" AND ");
        self.sql.push_str(clause);
        self.values.extend(values);
        self
    }
}

/// Search repository, stateless.
pub struct SearchRepo;

impl SearchRepo {
    /// Run a hybrid search across episodes, entities, facts and communities.
    pub fn hybrid(conn: &Connection, req: &SearchRequest) -> Result<SearchHits> {
        let fts = fts_query(&req.query);
        let vector = req.query_vector.as_deref().filter(|v| !v.is_empty());
        if req.limit == 0 || (fts.is_none() && vector.is_none()) {
            return Ok(SearchHits::default());
        }
        let depth = req.limit.saturating_mul(CANDIDATE_FACTOR);

        let layer_filter = || {
            if req.layers.is_empty() {
                Filter::default()
            } else {
                Filter::default().and(
                    &in_clause("t.layer", req.layers.len()),
                    text_values(req.layers.iter().map(|l| l.as_str())),
                )
            }
        };

        let ranked = |target: &Target, filter: &Filter| -> Result<Vec<(String, f64)>> {
            let mut lists = Vec::with_capacity(2);
            if let Some(q) = fts.as_deref() {
                lists.push(lexical(conn, target, q, filter, depth)?);
            }
            if let Some(v) = vector {
                lists.push(nearest(conn, target, v, filter, depth)?);
            }
            Ok(fuse(&lists, req.limit))
        };

        let mut hits = SearchHits::default();

        let ranked_episodes = ranked(&EPISODES, &layer_filter())?;
        (hits.episodes, hits.episode_scores) = load(
            conn,
            &ranked_episodes,
            &format!("SELECT {} FROM episodes", episode::COLUMNS),
            "id",
            map_episode,
            |e| e.id.as_str().to_string(),
        )?;

        let entity_filter = layer_filter().and("t.merged_into IS NULL", Vec::new());
        let ranked_entities = ranked(&ENTITIES, &entity_filter)?;
        (hits.entities, hits.entity_scores) = load(
            conn,
            &ranked_entities,
            &format!("SELECT {} FROM entities", entity::COLUMNS),
            "id",
            map_entity,
            |e| e.id.as_str().to_string(),
        )?;

        let (temporal_sql, temporal_values) = temporal_clause("t", req.temporal);
        let fact_filter = layer_filter().and(&temporal_sql, temporal_values);
        let ranked_facts = ranked(&FACTS, &fact_filter)?;
        (hits.facts, hits.fact_scores) = load(
            conn,
            &ranked_facts,
            fact::SELECT,
            "f.id",
            map_fact,
            |f| f.id.as_str().to_string(),
        )?;

        let ranked_communities = ranked(&COMMUNITIES, &layer_filter())?;
        (hits.communities, hits.community_scores) = load(
            conn,
            &ranked_communities,
            &format!("SELECT {} FROM communities", community::COLUMNS),
            "id",
            map_community,
            |c| c.id.as_str().to_string(),
        )?;

        Ok(hits)
    }
}

/// Quote each word so FTS5 operators in user text are matched literally,
/// and OR them together.
pub(crate) fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn lexical(
    conn: &Connection,
    target: &Target,
    query: &str,
    filter: &Filter,
    limit: usize,
) -> Result<Vec<String>> {
    let Target { table, fts } = target;
    let sql = format!(
        "SELECT t.id FROM {fts} JOIN {table} t ON {fts}.id = t.id
         WHERE {fts} MATCH ?{filter} ORDER BY bm25({fts}) LIMIT ?",
        filter = filter.sql
    );
    let mut values = vec![Value::Text(query.to_string())];
    values.extend(filter.values.iter().cloned());
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn nearest(
    conn: &Connection,
    target: &Target,
    query: &[f32],
    filter: &Filter,
    limit: usize,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT t.id, t.embedding FROM {table} t WHERE t.embedding IS NOT NULL{filter}",
        table = target.table,
        filter = filter.sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut scored = stmt
        .query_map(params_from_iter(filter.values.iter()), |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?
        .filter_map(|row| match row {
            Ok((id, blob)) => {
                let sim = cosine_similarity(query, &from_blob(&blob));
                (sim > 0.0).then_some(Ok((id, sim)))
            }
            Err(e) => Some(Err(e)),
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);
    Ok(scored.into_iter().map(|(id, _)| id).collect())
}

/// Reciprocal-rank fusion: each list contributes `1 / (k + rank)`.
pub(crate) fn fuse(lists: &[Vec<String>], limit: usize) -> Vec<(String, f64)> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            let entry = scores.entry(id.as_str()).or_insert_with(|| {
                first_seen.push(id.as_str());
                0.0
            });
            *entry += contribution;
        }
    }
    let mut fused: Vec<(String, f64)> = first_seen
        .into_iter()
        .map(|id| (id.to_string(), scores.get(id).copied().unwrap_or_default()))
        .collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    fused.truncate(limit);
    fused
}

/// Load records for ranked ids, keeping rank order and dropping vanished rows.
fn load<T>(
    conn: &Connection,
    ranked: &[(String, f64)],
    select: &str,
    id_column: &str,
    map: fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    key: impl Fn(&T) -> String,
) -> Result<(Vec<T>, Vec<f64>)> {
    if ranked.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let sql = format!(
        "{select} WHERE {}",
        in_clause(id_column, ranked.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(text_values(ranked.iter().map(|(id, _)| id))), map)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut by_id: HashMap<String, T> = rows.into_iter().map(|r| (key(&r), r)).collect();

    let mut items = Vec::with_capacity(ranked.len());
    let mut scores = Vec::with_capacity(ranked.len());
    for (id, score) in ranked {
        if let Some(item) = by_id.remove(id) {
            items.push(item);
            scores.push(*score);
        }
    }
    Ok((items, scores))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::entity::EntityRepo;
    use crate::repositories::episode::EpisodeRepo;
    use crate::repositories::fact::FactRepo;
    use crate::repositories::test_support::conn;
    use crate::types::{EntityPatch, NewEntity, NewEpisode, NewFact, TemporalFilter};
    use chrono::Utc;
    use strata_core::Layer;

    fn episode(conn: &Connection, content: &str, layer: Layer) -> strata_core::Episode {
        let mut new = NewEpisode::new("ep", content);
        new.layer = Some(layer);
        EpisodeRepo::insert(conn, &new).unwrap()
    }

    fn entity(conn: &Connection, name: &str, layer: Layer) -> strata_core::Entity {
        EntityRepo::upsert(
            conn,
            &NewEntity {
                name: name.into(),
                layer,
                summary: String::new(),
                tags: vec![],
            },
        )
        .unwrap()
    }

    fn request(query: &str, layers: Vec<Layer>) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            layers,
            limit: 10,
            ..Default::default()
        }
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("Lena's job").as_deref(), Some("\"Lena\" OR \"s\" OR \"job\""));
        assert_eq!(fts_query("  -- "), None);
    }

    #[test]
    fn fuse_rewards_agreement() {
        let lexical = vec!["a".to_string(), "b".to_string()];
        let vector = vec!["b".to_string(), "c".to_string()];
        let fused = fuse(&[lexical, vector], 10);
        assert_eq!(fused[0].0, "b");
        assert_eq!(fused.len(), 3);
        assert!((fused[0].1 - (1.0 / 3.0 + 1.0 / 2.0)).abs() < 1e-12);
    }

    #[test]
    fn top_hits_stay_above_expansion_scores() {
        let both = fuse(&[vec!["a".to_string()], vec!["a".to_string()]], 10);
        assert!((both[0].1 - 1.0).abs() < 1e-12);
        let single = fuse(&[vec!["a".to_string(), "b".to_string()]], 10);
        assert!((single[0].1 - 0.5).abs() < 1e-12);
        // Expanded relationships score 0.4 by default.
        assert!(single[0].1 > 0.4);
    }

    #[test]
    fn lexical_search_filters_layers() {
        let conn = conn();
        let _ = episode(&conn, "Lena is a designer", Layer::Knowledge);
        let _ = episode(&conn, "Lena likes tea", Layer::Personal);

        let all = SearchRepo::hybrid(&conn, &request("Lena", vec![])).unwrap();
        assert_eq!(all.episodes.len(), 2);
        assert_eq!(all.episode_scores.len(), 2);

        let personal = SearchRepo::hybrid(&conn, &request("Lena", vec![Layer::Personal])).unwrap();
        assert_eq!(personal.episodes.len(), 1);
        assert_eq!(personal.episodes[0].content, "Lena likes tea");

        let both = SearchRepo::hybrid(
            &conn,
            &request("Lena", vec![Layer::Personal, Layer::Knowledge]),
        )
        .unwrap();
        assert_eq!(both.episodes.len(), 2);
    }

    #[test]
    fn vector_leg_finds_unmatched_text() {
        let conn = conn();
        let ep = episode(&conn, "completely unrelated words", Layer::Knowledge);
        let _ = EpisodeRepo::set_embedding(&conn, &ep.id, &[1.0, 0.0]).unwrap();
        let other = episode(&conn, "other", Layer::Knowledge);
        let _ = EpisodeRepo::set_embedding(&conn, &other.id, &[0.0, 1.0]).unwrap();

        let mut req = request("zzz", vec![]);
        req.query_vector = Some(vec![0.9, 0.1]);
        let hits = SearchRepo::hybrid(&conn, &req).unwrap();
        assert_eq!(hits.episodes[0].id, ep.id);
    }

    #[test]
    fn merged_entities_are_hidden() {
        let conn = conn();
        let a = entity(&conn, "Lena", Layer::Personal);
        let b = entity(&conn, "Lena Smith", Layer::Personal);
        let _ = EntityRepo::merge(&conn, &a.id, &[b.id], &EntityPatch::default()).unwrap();
        let hits = SearchRepo::hybrid(&conn, &request("Lena", vec![])).unwrap();
        assert_eq!(hits.entities.len(), 1);
        assert_eq!(hits.entities[0].id, a.id);
    }

    #[test]
    fn facts_honour_temporal_filter() {
        let conn = conn();
        let lena = entity(&conn, "Lena", Layer::Knowledge);
        let role = entity(&conn, "designer", Layer::Knowledge);
        let fact = FactRepo::insert(
            &conn,
            &NewFact {
                layer: Layer::Knowledge,
                source: lena.id,
                target: role.id,
                relation: "works_as".into(),
                fact: "Lena works as a designer".into(),
                valid_at: None,
                episode: None,
            },
        )
        .unwrap();
        let hits = SearchRepo::hybrid(&conn, &request("designer", vec![])).unwrap();
        assert_eq!(hits.facts.len(), 1);

        let then = Utc::now();
        let _ = FactRepo::invalidate(&conn, &fact.id, then).unwrap();
        let hits = SearchRepo::hybrid(&conn, &request("designer", vec![])).unwrap();
        assert!(hits.facts.is_empty());

        let mut past = request("designer", vec![]);
        past.temporal = TemporalFilter::AsOf(then - chrono::Duration::seconds(1));
        let hits = SearchRepo::hybrid(&conn, &past).unwrap();
        assert_eq!(hits.facts.len(), 1);
    }

    #[test]
    fn empty_query_without_vector_returns_nothing() {
        let conn = conn();
        let _ = episode(&conn, "anything", Layer::Knowledge);
        assert!(SearchRepo::hybrid(&conn, &request("", vec![])).unwrap().is_empty());
    }
}
