//! Class-scoped similarity search for a stored detection.

use std::collections::BTreeSet;

use crate::db::{Database, Detection, Image};
use crate::error::{Error, Result};
use crate::services::SimilarityIndex;

/// One resolved neighbor, in the order the index returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub image: Image,
    pub detection_id: Option<i64>,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub query: Detection,
    pub hits: Vec<SearchHit>,
}

pub struct SearchAdapter<'a> {
    db: &'a Database,
    index: &'a dyn SimilarityIndex,
    top_k: usize,
}

impl<'a> SearchAdapter<'a> {
    pub fn new(db: &'a Database, index: &'a dyn SimilarityIndex, top_k: usize) -> Self {
        Self {
            db,
            index,
            top_k: top_k.max(1),
        }
    }

    /// Query the shard of the detection's class with its stored vector.
    ///
    /// Neighbors whose image no longer exists are dropped. Scores are passed
    /// through untouched and never re-sorted.
    pub fn search(&self, detection_id: i64) -> Result<SearchOutcome> {
        let query = self.db.get_detection(detection_id)?.ok_or(Error::NotFound {
            entity: "detection",
            id: detection_id,
        })?;

        let vector = self
            .db
            .get_descriptor(detection_id)?
            .map(|set| set.feature_vector)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingDescriptor { detection_id })?;

        let neighbors = self
            .index
            .search(query.class_id, &vector, self.top_k)
            .map_err(|e| Error::SearchUnavailable {
                class_id: query.class_id,
                reason: e.to_string(),
            })?;

        let ids: Vec<i64> = neighbors
            .iter()
            .map(|n| n.image_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let images = self.db.images_by_ids(&ids)?;

        let mut hits = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match images.get(&neighbor.image_id) {
                Some(image) => hits.push(SearchHit {
                    image: image.clone(),
                    detection_id: neighbor.detection_id,
                    score: neighbor.score,
                }),
                None => tracing::debug!(
                    image_id = neighbor.image_id,
                    "Dropping neighbor for missing image"
                ),
            }
        }

        tracing::info!(
            detection_id,
            class_id = query.class_id,
            hits = hits.len(),
            "Similarity search finished"
        );
        Ok(SearchOutcome { query, hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{memory_db, new_detection, new_image};
    use crate::db::DescriptorSet;
    use crate::services::{IndexItem, Neighbor};
    use std::sync::Mutex;

    struct FakeIndex {
        results: Vec<Neighbor>,
        fail: bool,
        queries: Mutex<Vec<(i64, Vec<f32>, usize)>>,
    }

    impl FakeIndex {
        fn returning(results: Vec<Neighbor>) -> Self {
            Self {
                results,
                fail: false,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    impl SimilarityIndex for FakeIndex {
        fn add(&self, _class_id: i64, _items: &[IndexItem]) -> Result<()> {
            Ok(())
        }

        fn search(&self, class_id: i64, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
            self.queries
                .lock()
                .unwrap()
                .push((class_id, vector.to_vec(), top_k));
            if self.fail {
                return Err(Error::upstream("index", "no index for class"));
            }
            Ok(self.results.clone())
        }
    }

    fn neighbor(image_id: i64, score: f32) -> Neighbor {
        Neighbor {
            image_id,
            detection_id: None,
            score,
        }
    }

    /// Returns the query detection id and three other image ids.
    fn seed(db: &Database) -> (i64, [i64; 3]) {
        let query_image = db
            .insert_image(
                &new_image("query.jpg", 100, 100),
                &[new_detection(3, [1.0, 1.0, 50.0, 50.0])],
            )
            .unwrap();
        let query = db.detections_for_image(query_image).unwrap()[0].id;
        db.upsert_descriptor(query, &DescriptorSet::with_vector(vec![0.5, 0.5]))
            .unwrap();

        let mut others = [0; 3];
        for (i, slot) in others.iter_mut().enumerate() {
            *slot = db
                .insert_image(&new_image(&format!("n{}.jpg", i), 100, 100), &[])
                .unwrap();
        }
        (query, others)
    }

    #[test]
    fn test_results_keep_index_order() {
        let db = memory_db();
        let (query, [a, b, c]) = seed(&db);
        let index = FakeIndex::returning(vec![neighbor(b, 0.01), neighbor(c, 0.02), neighbor(a, 0.05)]);

        let outcome = SearchAdapter::new(&db, &index, 12).search(query).unwrap();

        let scores: Vec<f32> = outcome.hits.iter().map(|h| h.score).collect();
        let ids: Vec<i64> = outcome.hits.iter().map(|h| h.image.id).collect();
        assert_eq!(scores, vec![0.01, 0.02, 0.05]);
        assert_eq!(ids, vec![b, c, a]);
        assert_eq!(*index.queries.lock().unwrap(), vec![(3, vec![0.5, 0.5], 12)]);
    }

    #[test]
    fn test_unsorted_index_results_are_not_resorted() {
        let db = memory_db();
        let (query, [a, b, c]) = seed(&db);
        let index = FakeIndex::returning(vec![
            Neighbor {
                image_id: a,
                detection_id: Some(11),
                score: 0.02,
            },
            neighbor(b, 0.05),
            Neighbor {
                image_id: c,
                detection_id: Some(13),
                score: 0.01,
            },
        ]);

        let outcome = SearchAdapter::new(&db, &index, 3).search(query).unwrap();

        let scores: Vec<f32> = outcome.hits.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![0.02, 0.05, 0.01]);
        let refs: Vec<(i64, Option<i64>)> = outcome
            .hits
            .iter()
            .map(|h| (h.image.id, h.detection_id))
            .collect();
        assert_eq!(refs, vec![(a, Some(11)), (b, None), (c, Some(13))]);
    }

    #[test]
    fn test_unknown_images_are_dropped() {
        let db = memory_db();
        let (query, [a, _, _]) = seed(&db);
        let index = FakeIndex::returning(vec![neighbor(999, 0.01), neighbor(a, 0.02)]);

        let outcome = SearchAdapter::new(&db, &index, 5).search(query).unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].image.id, a);
    }

    #[test]
    fn test_missing_descriptor() {
        let db = memory_db();
        let image = db
            .insert_image(&new_image("a.jpg", 10, 10), &[new_detection(1, [0.0, 0.0, 5.0, 5.0])])
            .unwrap();
        let detection = db.detections_for_image(image).unwrap()[0].id;
        let index = FakeIndex::returning(Vec::new());
        let adapter = SearchAdapter::new(&db, &index, 5);

        assert!(matches!(
            adapter.search(detection),
            Err(Error::MissingDescriptor { detection_id }) if detection_id == detection
        ));

        // An empty vector is as good as none.
        db.upsert_descriptor(detection, &DescriptorSet::default()).unwrap();
        assert!(matches!(adapter.search(detection), Err(Error::MissingDescriptor { .. })));
        assert!(index.queries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_index_failure_is_search_unavailable() {
        let db = memory_db();
        let (query, _) = seed(&db);
        let index = FakeIndex {
            fail: true,
            ..FakeIndex::returning(Vec::new())
        };

        assert!(matches!(
            SearchAdapter::new(&db, &index, 5).search(query),
            Err(Error::SearchUnavailable { class_id: 3, .. })
        ));
    }

    #[test]
    fn test_unknown_detection() {
        let db = memory_db();
        let index = FakeIndex::returning(Vec::new());
        assert!(matches!(
            SearchAdapter::new(&db, &index, 5).search(7),
            Err(Error::NotFound { entity: "detection", id: 7 })
        ));
    }
}
