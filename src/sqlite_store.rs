//! SQLite-backed [`Store`] implementation.
//!
//! Each chunk commit runs in one transaction; rows are written with
//! multi-row `INSERT ... ON CONFLICT DO NOTHING` statements of at most
//! `sub_batch_size` rows each. Fingerprints are stored as the bit pattern
//! of an `i64`, with the four 16-bit bands in indexed columns for
//! candidate lookup. Full-text search goes through the `atoms_fts` FTS5
//! index, ranked by BM25.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use anchor_core::fingerprint::bands;
use anchor_core::models::{Atom, Compound, Molecule, Provenance, TagAssoc, QUARANTINE_TAG};
use anchor_core::store::{
    AtomFilter, ChunkWrite, CommitReport, FingerprintQuery, FingerprintRecord, FingerprintScope,
    MatchMode, Neighbor, Store, TextHit, TextQuery,
};
use anchor_core::AnchorError;

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Ids per `IN (...)` list.
const ID_BATCH: usize = 500;

const ATOM_COLUMNS: &str = "a.id, a.content, a.content_hash, a.source_path, a.sequence, \
     a.content_type, a.fingerprint, a.provenance, a.first_seen, a.last_seen, a.occurrences";

const MOLECULE_COLUMNS: &str = "id, compound_id, sequence, start_byte, end_byte, content_type, \
     numeric_value, numeric_unit, fingerprint, timestamp, atom_id, oversized, continued";

/// Map connection-level failures to [`AnchorError::StoreUnavailable`] so
/// the engine can tell them apart from query errors.
trait SqlResultExt<T> {
    fn or_unavailable(self) -> Result<T>;
}

impl<T> SqlResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn or_unavailable(self) -> Result<T> {
        self.map_err(classify)
    }
}

fn classify(err: sqlx::Error) -> anyhow::Error {
    let unavailable = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_IOERR, SQLITE_CANTOPEN
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .is_some_and(|c| matches!(c & 0xff, 5 | 6 | 10 | 14)),
        _ => false,
    };
    if unavailable {
        anyhow::Error::new(AnchorError::StoreUnavailable(err.to_string()))
    } else {
        anyhow::Error::new(err)
    }
}

fn to_usize(v: i64) -> usize {
    usize::try_from(v).unwrap_or(0)
}

fn row_to_atom(row: &SqliteRow) -> Result<Atom> {
    let content_type: String = row.try_get("content_type")?;
    let provenance: String = row.try_get("provenance")?;
    let fingerprint: i64 = row.try_get("fingerprint")?;
    Ok(Atom {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        source_path: row.try_get("source_path")?,
        sequence: row.try_get("sequence")?,
        content_type: content_type.parse()?,
        fingerprint: fingerprint as u64,
        provenance: provenance.parse()?,
        tags: Vec::new(),
        buckets: Vec::new(),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        occurrences: row.try_get("occurrences")?,
    })
}

fn row_to_molecule(row: &SqliteRow) -> Result<Molecule> {
    let content_type: String = row.try_get("content_type")?;
    let fingerprint: i64 = row.try_get("fingerprint")?;
    Ok(Molecule {
        id: row.try_get("id")?,
        compound_id: row.try_get("compound_id")?,
        sequence: row.try_get("sequence")?,
        start_byte: to_usize(row.try_get("start_byte")?),
        end_byte: to_usize(row.try_get("end_byte")?),
        content_type: content_type.parse()?,
        numeric_value: row.try_get("numeric_value")?,
        numeric_unit: row.try_get("numeric_unit")?,
        fingerprint: fingerprint as u64,
        timestamp: row.try_get("timestamp")?,
        atom_id: row.try_get("atom_id")?,
        oversized: row.try_get("oversized")?,
        continued: row.try_get("continued")?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<FingerprintRecord> {
    let fingerprint: i64 = row.try_get("fingerprint")?;
    Ok(FingerprintRecord {
        atom_id: row.try_get("id")?,
        fingerprint: fingerprint as u64,
        content_hash: row.try_get("content_hash")?,
        last_seen: row.try_get("last_seen")?,
    })
}

/// Append the [`AtomFilter`] conditions for an `atoms a` alias.
fn push_filter<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a AtomFilter) {
    const TAGGED: &str = " EXISTS (SELECT 1 FROM tag_assoc q WHERE q.atom_id = a.id AND q.tag = ";
    match filter.provenance {
        None => {
            qb.push(" AND a.provenance != ")
                .push_bind(Provenance::Quarantined.as_str())
                .push(" AND NOT")
                .push(TAGGED)
                .push_bind(QUARANTINE_TAG)
                .push(")");
        }
        Some(Provenance::Quarantined) => {
            qb.push(" AND (a.provenance = ")
                .push_bind(Provenance::Quarantined.as_str())
                .push(" OR")
                .push(TAGGED)
                .push_bind(QUARANTINE_TAG)
                .push("))");
        }
        Some(p) => {
            qb.push(" AND a.provenance = ")
                .push_bind(p.as_str())
                .push(" AND NOT")
                .push(TAGGED)
                .push_bind(QUARANTINE_TAG)
                .push(")");
        }
    }
    if !filter.buckets.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM atom_buckets fb WHERE fb.atom_id = a.id AND fb.bucket IN (");
        let mut sep = qb.separated(", ");
        for bucket in &filter.buckets {
            sep.push_bind(bucket.as_str());
        }
        qb.push("))");
    }
    if !filter.tags.is_empty() {
        qb.push(" AND EXISTS (SELECT 1 FROM tag_assoc ft WHERE ft.atom_id = a.id AND ft.tag IN (");
        let mut sep = qb.separated(", ");
        for tag in &filter.tags {
            sep.push_bind(tag.as_str());
        }
        qb.push("))");
    }
}

fn push_band_match(qb: &mut QueryBuilder<'_, Sqlite>, wanted: &[u16; 4]) {
    for (i, band) in wanted.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push(format!("a.fp_band{} = ", i)).push_bind(*band as i64);
    }
}

/// FTS5 query string: each term quoted, joined by AND or OR.
fn fts_expression(terms: &[String], mode: MatchMode) -> String {
    let joiner = match mode {
        MatchMode::All => " AND ",
        MatchMode::Any => " OR ",
    };
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(joiner)
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `variant_of` links touching `atom_id`, either direction, as
    /// `(atom_id, canonical_id, distance)`.
    pub async fn variant_links(&self, atom_id: &str) -> Result<Vec<(String, String, u8)>> {
        let rows = sqlx::query(
            "SELECT atom_id, canonical_id, distance FROM variant_of \
             WHERE atom_id = ? OR canonical_id = ? ORDER BY atom_id, canonical_id",
        )
        .bind(atom_id)
        .bind(atom_id)
        .fetch_all(&self.pool)
        .await
        .or_unavailable()?;

        rows.iter()
            .map(|row| -> Result<(String, String, u8)> {
                let distance: i64 = row.try_get("distance")?;
                Ok((
                    row.try_get("atom_id")?,
                    row.try_get("canonical_id")?,
                    u8::try_from(distance).unwrap_or(u8::MAX),
                ))
            })
            .collect()
    }

    /// Fill `tags` from `tag_assoc` and `buckets` from `atom_buckets`
    /// plus any bucket a tag row names.
    async fn hydrate(&self, atoms: &mut [Atom]) -> Result<()> {
        for batch in atoms.chunks_mut(ID_BATCH) {
            let ids: Vec<String> = batch.iter().map(|a| a.id.clone()).collect();
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT atom_id, tag, bucket FROM tag_assoc WHERE atom_id IN (",
            );
            push_id_list(&mut qb, &ids);
            let tag_rows = qb.build().fetch_all(&self.pool).await.or_unavailable()?;

            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT atom_id, bucket FROM atom_buckets WHERE atom_id IN (");
            push_id_list(&mut qb, &ids);
            let bucket_rows = qb.build().fetch_all(&self.pool).await.or_unavailable()?;

            let mut pairs: HashMap<String, (BTreeSet<String>, BTreeSet<String>)> = HashMap::new();
            for row in &tag_rows {
                let entry = pairs.entry(row.try_get("atom_id")?).or_default();
                entry.0.insert(row.try_get("tag")?);
                entry.1.insert(row.try_get("bucket")?);
            }
            for row in &bucket_rows {
                let entry = pairs.entry(row.try_get("atom_id")?).or_default();
                entry.1.insert(row.try_get("bucket")?);
            }
            for atom in batch.iter_mut() {
                if let Some((tags, buckets)) = pairs.remove(&atom.id) {
                    atom.tags = tags.into_iter().collect();
                    atom.buckets = buckets.into_iter().collect();
                }
            }
        }
        Ok(())
    }
}

fn push_id_list<'a>(qb: &mut QueryBuilder<'a, Sqlite>, ids: &'a [String]) {
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id.as_str());
    }
    qb.push(")");
}

#[async_trait]
impl Store for SqliteStore {
    async fn commit_chunk(&self, write: &ChunkWrite) -> Result<CommitReport> {
        let size = write.sub_batch_size.max(1);
        let mut report = CommitReport::default();
        let mut tx = self.pool.begin().await.or_unavailable()?;

        if write.replace_previous {
            sqlx::query(
                "DELETE FROM molecules WHERE compound_id IN \
                 (SELECT id FROM compounds WHERE path = ? AND id != ?)",
            )
            .bind(&write.compound.path)
            .bind(&write.compound.id)
            .execute(&mut *tx)
            .await
            .or_unavailable()?;
            sqlx::query("DELETE FROM compounds WHERE path = ? AND id != ?")
                .bind(&write.compound.path)
                .bind(&write.compound.id)
                .execute(&mut *tx)
                .await
                .or_unavailable()?;
        }

        let compound = &write.compound;
        sqlx::query(
            "INSERT INTO compounds (id, path, timestamp, provenance, signature, content) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(&compound.id)
        .bind(&compound.path)
        .bind(compound.timestamp)
        .bind(compound.provenance.as_str())
        .bind(compound.signature as i64)
        .bind(&compound.content)
        .execute(&mut *tx)
        .await
        .or_unavailable()?;

        for batch in write.atoms.chunks(size) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO atoms (id, content, content_hash, source_path, sequence, \
                 content_type, fingerprint, fp_band0, fp_band1, fp_band2, fp_band3, \
                 provenance, first_seen, last_seen, occurrences) ",
            );
            qb.push_values(batch, |mut b, atom| {
                b.push_bind(atom.id.as_str())
                    .push_bind(atom.content.as_str())
                    .push_bind(atom.content_hash.as_str())
                    .push_bind(atom.source_path.as_str())
                    .push_bind(atom.sequence)
                    .push_bind(atom.content_type.as_str())
                    .push_bind(atom.fingerprint as i64);
                for band in bands(atom.fingerprint) {
                    b.push_bind(band as i64);
                }
                b.push_bind(atom.provenance.as_str())
                    .push_bind(atom.first_seen)
                    .push_bind(atom.last_seen)
                    .push_bind(atom.occurrences);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let done = qb.build().execute(&mut *tx).await.or_unavailable()?;
            report.atoms_inserted += done.rows_affected() as usize;
        }

        for batch in write.molecules.chunks(size) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO molecules ({}) ", MOLECULE_COLUMNS));
            qb.push_values(batch, |mut b, m| {
                b.push_bind(m.id.as_str())
                    .push_bind(m.compound_id.as_str())
                    .push_bind(m.sequence)
                    .push_bind(m.start_byte as i64)
                    .push_bind(m.end_byte as i64)
                    .push_bind(m.content_type.as_str())
                    .push_bind(m.numeric_value)
                    .push_bind(m.numeric_unit.as_deref())
                    .push_bind(m.fingerprint as i64)
                    .push_bind(m.timestamp)
                    .push_bind(m.atom_id.as_deref())
                    .push_bind(m.oversized)
                    .push_bind(m.continued);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let done = qb.build().execute(&mut *tx).await.or_unavailable()?;
            report.molecules_inserted += done.rows_affected() as usize;
        }

        for touch in &write.touches {
            let done = sqlx::query(
                "UPDATE atoms SET last_seen = MAX(last_seen, ?), occurrences = occurrences + 1 \
                 WHERE id = ?",
            )
            .bind(touch.seen_at)
            .bind(&touch.atom_id)
            .execute(&mut *tx)
            .await
            .or_unavailable()?;
            report.atoms_touched += done.rows_affected() as usize;
        }

        for batch in write.tags.chunks(size) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO tag_assoc (atom_id, tag, bucket) ");
            qb.push_values(batch, |mut b, t| {
                b.push_bind(t.atom_id.as_str())
                    .push_bind(t.tag.as_str())
                    .push_bind(t.bucket.as_str());
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let done = qb.build().execute(&mut *tx).await.or_unavailable()?;
            report.tags_inserted += done.rows_affected() as usize;
        }

        for batch in write.memberships.chunks(size) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO atom_buckets (atom_id, bucket) ");
            qb.push_values(batch, |mut b, m| {
                b.push_bind(m.atom_id.as_str()).push_bind(m.bucket.as_str());
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let done = qb.build().execute(&mut *tx).await.or_unavailable()?;
            report.memberships_inserted += done.rows_affected() as usize;
        }

        for batch in write.variants.chunks(size) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO variant_of (atom_id, canonical_id, distance) ");
            qb.push_values(batch, |mut b, v| {
                b.push_bind(v.atom_id.as_str())
                    .push_bind(v.canonical_id.as_str())
                    .push_bind(v.distance as i64);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            let done = qb.build().execute(&mut *tx).await.or_unavailable()?;
            report.variants_inserted += done.rows_affected() as usize;
        }

        tx.commit().await.or_unavailable()?;
        Ok(report)
    }

    async fn atom_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM atoms")
            .fetch_one(&self.pool)
            .await
            .or_unavailable()?;
        Ok(count.max(0) as u64)
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<FingerprintRecord>> {
        let row = sqlx::query(
            "SELECT id, fingerprint, content_hash, last_seen FROM atoms WHERE content_hash = ?",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .or_unavailable()?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn fingerprint_candidates(&self, query: &FingerprintQuery) -> Result<Vec<FingerprintRecord>> {
        let rows = match &query.scope {
            FingerprintScope::Exhaustive => {
                sqlx::query("SELECT id, fingerprint, content_hash, last_seen FROM atoms")
                    .fetch_all(&self.pool)
                    .await
                    .or_unavailable()?
            }
            FingerprintScope::Scoped {
                bands: wanted,
                buckets,
                since,
            } => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT a.id AS id, a.fingerprint AS fingerprint, \
                     a.content_hash AS content_hash, a.last_seen AS last_seen, (",
                );
                push_band_match(&mut qb, wanted);
                qb.push(") AS band_hit FROM atoms a WHERE (");
                push_band_match(&mut qb, wanted);
                qb.push(")");
                if !buckets.is_empty() {
                    qb.push(" OR (a.last_seen >= ")
                        .push_bind(*since)
                        .push(" AND EXISTS (SELECT 1 FROM atom_buckets m WHERE m.atom_id = a.id AND m.bucket IN (");
                    let mut sep = qb.separated(", ");
                    for bucket in buckets {
                        sep.push_bind(bucket.as_str());
                    }
                    qb.push(")))");
                }
                qb.push(" ORDER BY band_hit DESC, a.last_seen DESC, a.id ASC LIMIT ")
                    .push_bind(query.limit as i64);
                qb.build().fetch_all(&self.pool).await.or_unavailable()?
            }
        };
        rows.iter().map(row_to_record).collect()
    }

    async fn text_search(&self, query: &TextQuery<'_>) -> Result<Vec<TextHit>> {
        if query.terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {}, -bm25(atoms_fts) AS score FROM atoms_fts \
             JOIN atoms a ON a.pk = atoms_fts.rowid WHERE atoms_fts MATCH ",
            ATOM_COLUMNS
        ));
        qb.push_bind(fts_expression(query.terms, query.mode));
        push_filter(&mut qb, query.filter);
        qb.push(" ORDER BY score DESC, a.last_seen DESC, a.id ASC LIMIT ")
            .push_bind(query.limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.or_unavailable()?;
        let mut atoms = Vec::with_capacity(rows.len());
        let mut scores = Vec::with_capacity(rows.len());
        for row in &rows {
            atoms.push(row_to_atom(row)?);
            scores.push(row.try_get::<f64, _>("score")?);
        }
        self.hydrate(&mut atoms).await?;
        Ok(atoms
            .into_iter()
            .zip(scores)
            .map(|(atom, score)| TextHit { atom, score })
            .collect())
    }

    async fn tag_neighbors(
        &self,
        anchor_ids: &[String],
        exclude: &[String],
        filter: &AtomFilter,
        per_anchor_limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let mut out = Vec::new();
        for anchor_id in anchor_ids {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT t2.atom_id AS atom_id, COUNT(DISTINCT t2.tag) AS shared, \
                 a.last_seen AS last_seen \
                 FROM tag_assoc t1 \
                 JOIN tag_assoc t2 ON t2.tag = t1.tag AND t2.bucket = t1.bucket \
                 JOIN atoms a ON a.id = t2.atom_id \
                 WHERE t1.atom_id = ",
            );
            qb.push_bind(anchor_id.as_str())
                .push(" AND t1.tag != ")
                .push_bind(QUARANTINE_TAG)
                .push(" AND t2.atom_id NOT IN (");
            let mut sep = qb.separated(", ");
            for id in anchor_ids.iter().chain(exclude) {
                sep.push_bind(id.as_str());
            }
            qb.push(")");
            push_filter(&mut qb, filter);
            qb.push(" GROUP BY t2.atom_id ORDER BY shared DESC, last_seen DESC, t2.atom_id ASC LIMIT ")
                .push_bind(per_anchor_limit as i64);

            let rows = qb.build().fetch_all(&self.pool).await.or_unavailable()?;
            let mut ids = Vec::with_capacity(rows.len());
            let mut shared = HashMap::with_capacity(rows.len());
            for row in &rows {
                let id: String = row.try_get("atom_id")?;
                let count: i64 = row.try_get("shared")?;
                shared.insert(id.clone(), to_usize(count));
                ids.push(id);
            }
            for atom in self.get_atoms(&ids).await? {
                let shared_tags = shared.get(&atom.id).copied().unwrap_or(0);
                out.push(Neighbor {
                    anchor_id: anchor_id.clone(),
                    atom,
                    shared_tags,
                });
            }
        }
        Ok(out)
    }

    async fn get_atoms(&self, ids: &[String]) -> Result<Vec<Atom>> {
        let mut found: HashMap<String, Atom> = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(ID_BATCH) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM atoms a WHERE a.id IN (", ATOM_COLUMNS));
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(id.as_str());
            }
            qb.push(")");
            for row in qb.build().fetch_all(&self.pool).await.or_unavailable()? {
                let atom = row_to_atom(&row)?;
                found.insert(atom.id.clone(), atom);
            }
        }
        let mut atoms: Vec<Atom> = ids.iter().filter_map(|id| found.get(id).cloned()).collect();
        self.hydrate(&mut atoms).await?;
        Ok(atoms)
    }

    async fn get_compound(&self, id: &str) -> Result<Option<Compound>> {
        let row = sqlx::query(
            "SELECT id, path, timestamp, provenance, signature, content FROM compounds WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .or_unavailable()?;

        let Some(row) = row else {
            return Ok(None);
        };
        let provenance: String = row.try_get("provenance")?;
        let signature: i64 = row.try_get("signature")?;
        Ok(Some(Compound {
            id: row.try_get("id")?,
            path: row.try_get("path")?,
            timestamp: row.try_get("timestamp")?,
            provenance: provenance.parse()?,
            signature: signature as u64,
            content: row.try_get("content")?,
        }))
    }

    async fn locate_atom(&self, atom_id: &str) -> Result<Option<Molecule>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM molecules WHERE atom_id = ? \
             ORDER BY timestamp DESC, compound_id ASC, sequence ASC LIMIT 1",
            MOLECULE_COLUMNS
        ))
        .bind(atom_id)
        .fetch_optional(&self.pool)
        .await
        .or_unavailable()?;
        row.as_ref().map(row_to_molecule).transpose()
    }

    async fn molecules_for(&self, compound_id: &str) -> Result<Vec<Molecule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM molecules WHERE compound_id = ? ORDER BY sequence ASC",
            MOLECULE_COLUMNS
        ))
        .bind(compound_id)
        .fetch_all(&self.pool)
        .await
        .or_unavailable()?;
        rows.iter().map(row_to_molecule).collect()
    }

    async fn add_tags(&self, tags: &[TagAssoc]) -> Result<usize> {
        let mut tx = self.pool.begin().await.or_unavailable()?;
        let mut added = 0;
        for assoc in tags {
            let done = sqlx::query(
                "INSERT INTO tag_assoc (atom_id, tag, bucket) \
                 SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM atoms WHERE id = ?) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&assoc.atom_id)
            .bind(&assoc.tag)
            .bind(&assoc.bucket)
            .bind(&assoc.atom_id)
            .execute(&mut *tx)
            .await
            .or_unavailable()?;
            added += done.rows_affected() as usize;
            sqlx::query(
                "INSERT INTO atom_buckets (atom_id, bucket) \
                 SELECT ?, ? WHERE EXISTS (SELECT 1 FROM atoms WHERE id = ?) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&assoc.atom_id)
            .bind(&assoc.bucket)
            .bind(&assoc.atom_id)
            .execute(&mut *tx)
            .await
            .or_unavailable()?;
        }
        tx.commit().await.or_unavailable()?;
        Ok(added)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
