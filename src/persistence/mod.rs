//! SQLite persistence for cycle artifacts
//!
//! Single-writer relational store: positions, per-cycle news signals,
//! append-only DEFCON transitions, pending decisions and the restored
//! orchestrator state. All writes happen from the orchestrator task;
//! reads may be concurrent. A failed write is retried once on a fresh
//! connection and then spilled to a JSONL file so a cycle never dies on
//! storage trouble.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::types::{
    BrokerMode, CrisisType, DecisionKind, DecisionStatus, DefconLevel, DefconState, ExitReason,
    NewsSignal, PendingDecision, Position, PositionStatus, ReasonCode, SentimentDist,
};

/// Expected table set; missing tables are created at startup,
/// unknown columns are ignored by the named-column queries.
const EXPECTED_TABLES: [(&str, &str); 6] = [
    (
        "positions",
        "CREATE TABLE positions (
            id INTEGER PRIMARY KEY,
            symbol TEXT NOT NULL,
            qty REAL NOT NULL,
            entry_price REAL NOT NULL,
            entry_time TEXT NOT NULL,
            entry_defcon INTEGER NOT NULL,
            peak_price REAL NOT NULL,
            current_price REAL NOT NULL,
            status TEXT NOT NULL,
            exit_price REAL,
            exit_time TEXT,
            exit_reason TEXT
        )",
    ),
    (
        "news_signals",
        "CREATE TABLE news_signals (
            cycle_id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            article_count INTEGER NOT NULL,
            score REAL NOT NULL,
            crisis_type TEXT NOT NULL,
            bearish REAL NOT NULL,
            bullish REAL NOT NULL,
            neutral REAL NOT NULL,
            top_articles TEXT NOT NULL,
            breaking_count INTEGER NOT NULL
        )",
    ),
    (
        "market_snapshots",
        "CREATE TABLE market_snapshots (
            cycle_id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            vix REAL NOT NULL,
            bond_yield_10y REAL NOT NULL,
            sp500_change_pct REAL NOT NULL,
            per_symbol_price TEXT NOT NULL,
            stale INTEGER NOT NULL
        )",
    ),
    (
        "defcon_states",
        "CREATE TABLE defcon_states (
            entered_at TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            signal_score REAL NOT NULL,
            reason_code TEXT NOT NULL
        )",
    ),
    (
        "pending_decisions",
        "CREATE TABLE pending_decisions (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            subject TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            status TEXT NOT NULL
        )",
    ),
    (
        "orchestrator_state",
        "CREATE TABLE orchestrator_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            broker_mode TEXT NOT NULL,
            cycle_interval_sec INTEGER NOT NULL,
            cycle_count INTEGER NOT NULL
        )",
    ),
];

/// Async wrapper over a single rusqlite connection
pub struct Store {
    path: String,
    conn: Mutex<Connection>,
    spill_path: PathBuf,
}

impl Store {
    /// Open (creating directories as needed), enable WAL and migrate
    pub async fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("opening store at {}", db_path))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let spill_path = Path::new(db_path)
            .parent()
            .map(|p| p.join("spill.jsonl"))
            .unwrap_or_else(|| PathBuf::from("spill.jsonl"));

        let store = Self {
            path: db_path.to_string(),
            conn: Mutex::new(conn),
            spill_path,
        };
        store.migrate().await?;
        info!(path = db_path, "store initialized");
        Ok(store)
    }

    /// Forward-only migration: create whatever is missing
    async fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        let existing: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.filter_map(std::result::Result::ok).collect()
        };

        for (name, ddl) in EXPECTED_TABLES {
            if !existing.iter().any(|t| t == name) {
                conn.execute(ddl, [])?;
                info!(table = name, "created missing table");
            }
        }
        Ok(())
    }

    /// Run a write; retry once on a fresh connection, then spill the
    /// artifact and carry on (availability over durability).
    async fn write_with_retry<A, F>(&self, label: &str, artifact: &A, write: F) -> Result<()>
    where
        A: Serialize,
        F: Fn(&Connection) -> rusqlite::Result<()>,
    {
        let mut conn = self.conn.lock().await;
        if write(&conn).is_ok() {
            return Ok(());
        }

        warn!(label, "store write failed, retrying on a fresh connection");
        match Connection::open(&self.path) {
            Ok(fresh) => {
                let retried = write(&fresh);
                *conn = fresh;
                if retried.is_ok() {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(label, error = %err, "could not reopen store");
            }
        }

        self.spill(label, artifact);
        Ok(())
    }

    fn spill<A: Serialize>(&self, label: &str, artifact: &A) {
        let line = serde_json::json!({
            "label": label,
            "at": Utc::now().to_rfc3339(),
            "artifact": artifact,
        });
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spill_path)
            .and_then(|mut f| writeln!(f, "{}", line));
        match written {
            Ok(()) => error!(label, path = %self.spill_path.display(), "artifact spilled"),
            Err(err) => error!(label, error = %err, "artifact lost: spill write failed"),
        }
    }

    // ── Positions ───────────────────────────────────────────────

    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let p = position.clone();
        self.write_with_retry("position", position, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO positions
                 (id, symbol, qty, entry_price, entry_time, entry_defcon,
                  peak_price, current_price, status, exit_price, exit_time, exit_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    p.id,
                    p.symbol,
                    p.qty,
                    p.entry_price,
                    p.entry_time.to_rfc3339(),
                    p.entry_defcon.as_u8(),
                    p.peak_price,
                    p.current_price,
                    p.status.as_str(),
                    p.exit_price,
                    p.exit_time.map(|t| t.to_rfc3339()),
                    p.exit_reason.map(|r| r.as_str().to_string()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, qty, entry_price, entry_time, entry_defcon,
                    peak_price, current_price, status, exit_price, exit_time, exit_reason
             FROM positions WHERE status != 'closed' ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_position)?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    pub async fn max_position_id(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM positions", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    // ── News signals ────────────────────────────────────────────

    pub async fn insert_news_signal(&self, signal: &NewsSignal) -> Result<()> {
        let s = signal.clone();
        let top = serde_json::to_string(&s.top_articles)?;
        self.write_with_retry("news_signal", signal, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO news_signals
                 (cycle_id, timestamp, article_count, score, crisis_type,
                  bearish, bullish, neutral, top_articles, breaking_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    s.cycle_id as i64,
                    s.timestamp.to_rfc3339(),
                    s.article_count as i64,
                    s.score,
                    s.crisis_type.as_str(),
                    s.sentiment.bearish,
                    s.sentiment.bullish,
                    s.sentiment.neutral,
                    top,
                    s.breaking_count as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn latest_news_signal(&self) -> Result<Option<NewsSignal>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT cycle_id, timestamp, article_count, score, crisis_type,
                    bearish, bullish, neutral, top_articles, breaking_count
             FROM news_signals ORDER BY cycle_id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], row_to_news_signal)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ── Market snapshots ────────────────────────────────────────

    pub async fn insert_market_snapshot(
        &self,
        cycle_id: u64,
        snapshot: &crate::types::MarketSnapshot,
    ) -> Result<()> {
        let s = snapshot.clone();
        let prices = serde_json::to_string(&s.per_symbol_price)?;
        self.write_with_retry("market_snapshot", snapshot, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO market_snapshots
                 (cycle_id, timestamp, vix, bond_yield_10y, sp500_change_pct,
                  per_symbol_price, stale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    cycle_id as i64,
                    s.timestamp.to_rfc3339(),
                    s.vix,
                    s.bond_yield_10y,
                    s.sp500_change_pct,
                    prices,
                    s.stale as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    // ── DEFCON transitions ──────────────────────────────────────

    pub async fn insert_defcon_state(&self, state: &DefconState) -> Result<()> {
        let s = state.clone();
        self.write_with_retry("defcon_state", state, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO defcon_states
                 (entered_at, level, signal_score, reason_code)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    s.entered_at.to_rfc3339(),
                    s.level.as_u8(),
                    s.signal_score,
                    s.reason_code.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn latest_defcon_state(&self) -> Result<Option<DefconState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT entered_at, level, signal_score, reason_code
             FROM defcon_states ORDER BY entered_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], |row| {
            let entered_at: String = row.get(0)?;
            let level: u8 = row.get(1)?;
            Ok(DefconState {
                entered_at: parse_time(&entered_at),
                level: DefconLevel::from_u8(level).unwrap_or(DefconLevel::Five),
                signal_score: row.get(2)?,
                reason_code: ReasonCode::parse(&row.get::<_, String>(3)?)
                    .unwrap_or(ReasonCode::NewsScore),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ── Pending decisions ───────────────────────────────────────

    pub async fn save_decision(&self, decision: &PendingDecision) -> Result<()> {
        let d = decision.clone();
        self.write_with_retry("pending_decision", decision, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pending_decisions
                 (id, kind, subject, created_at, expires_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    d.id,
                    d.kind.as_str(),
                    d.subject,
                    d.created_at.to_rfc3339(),
                    d.expires_at.to_rfc3339(),
                    d.status.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// The single active entry decision, if one is awaiting
    pub async fn awaiting_entry_decision(&self) -> Result<Option<PendingDecision>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, kind, subject, created_at, expires_at, status
             FROM pending_decisions
             WHERE kind = 'entry' AND status = 'awaiting'
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], |row| {
            Ok(PendingDecision {
                id: row.get(0)?,
                kind: DecisionKind::parse(&row.get::<_, String>(1)?)
                    .unwrap_or(DecisionKind::Entry),
                subject: row.get(2)?,
                created_at: parse_time(&row.get::<_, String>(3)?),
                expires_at: parse_time(&row.get::<_, String>(4)?),
                status: DecisionStatus::parse(&row.get::<_, String>(5)?)
                    .unwrap_or(DecisionStatus::Awaiting),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ── Orchestrator state ──────────────────────────────────────

    pub async fn save_orchestrator_state(
        &self,
        broker_mode: BrokerMode,
        cycle_interval_sec: u64,
        cycle_count: u64,
    ) -> Result<()> {
        let artifact = serde_json::json!({
            "broker_mode": broker_mode.as_str(),
            "cycle_interval_sec": cycle_interval_sec,
            "cycle_count": cycle_count,
        });
        self.write_with_retry("orchestrator_state", &artifact, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO orchestrator_state
                 (id, broker_mode, cycle_interval_sec, cycle_count)
                 VALUES (1, ?1, ?2, ?3)",
                params![
                    broker_mode.as_str(),
                    cycle_interval_sec as i64,
                    cycle_count as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_orchestrator_state(&self) -> Result<Option<(BrokerMode, u64, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT broker_mode, cycle_interval_sec, cycle_count
             FROM orchestrator_state WHERE id = 1",
        )?;
        let mut rows = stmt.query_map([], |row| {
            let mode: String = row.get(0)?;
            Ok((
                BrokerMode::parse(&mode).unwrap_or(BrokerMode::Disabled),
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let entry_defcon: u8 = row.get(5)?;
    let status: String = row.get(8)?;
    let exit_time: Option<String> = row.get(10)?;
    let exit_reason: Option<String> = row.get(11)?;
    Ok(Position {
        id: row.get(0)?,
        symbol: row.get(1)?,
        qty: row.get(2)?,
        entry_price: row.get(3)?,
        entry_time: parse_time(&row.get::<_, String>(4)?),
        entry_defcon: DefconLevel::from_u8(entry_defcon).unwrap_or(DefconLevel::Five),
        peak_price: row.get(6)?,
        current_price: row.get(7)?,
        status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Open),
        exit_price: row.get(9)?,
        exit_time: exit_time.as_deref().map(parse_time),
        exit_reason: exit_reason.as_deref().and_then(ExitReason::parse),
    })
}

fn row_to_news_signal(row: &rusqlite::Row) -> rusqlite::Result<NewsSignal> {
    let crisis: String = row.get(4)?;
    let top: String = row.get(8)?;
    Ok(NewsSignal {
        cycle_id: row.get::<_, i64>(0)? as u64,
        timestamp: parse_time(&row.get::<_, String>(1)?),
        article_count: row.get::<_, i64>(2)? as usize,
        score: row.get(3)?,
        crisis_type: CrisisType::parse(&crisis).unwrap_or(CrisisType::None),
        sentiment: SentimentDist {
            bearish: row.get(5)?,
            bullish: row.get(6)?,
            neutral: row.get(7)?,
        },
        top_articles: serde_json::from_str(&top).unwrap_or_default(),
        breaking_count: row.get::<_, i64>(9)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_position(id: i64) -> Position {
        Position {
            id,
            symbol: "SPY".to_string(),
            qty: 12.0,
            entry_price: 500.0,
            entry_time: Utc::now(),
            entry_defcon: DefconLevel::Two,
            peak_price: 512.5,
            current_price: 508.0,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        }
    }

    #[tokio::test]
    async fn test_store_init_creates_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).await;
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_position_round_trip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = Store::open(path.to_str().unwrap()).await.unwrap();
            store.save_position(&make_position(1)).await.unwrap();
        }

        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        let open = store.load_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].peak_price, 512.5);
        assert_eq!(open[0].entry_defcon, DefconLevel::Two);
        assert_eq!(store.max_position_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_positions_excluded_from_open_set() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db").to_str().unwrap())
            .await
            .unwrap();

        let mut closed = make_position(1);
        closed.status = PositionStatus::Closed;
        closed.exit_price = Some(490.0);
        closed.exit_reason = Some(ExitReason::StopLoss);
        store.save_position(&closed).await.unwrap();
        store.save_position(&make_position(2)).await.unwrap();

        let open = store.load_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, 2);
    }

    #[tokio::test]
    async fn test_latest_defcon_state() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db").to_str().unwrap())
            .await
            .unwrap();
        assert!(store.latest_defcon_state().await.unwrap().is_none());

        let earlier = DefconState {
            level: DefconLevel::Four,
            signal_score: 35.0,
            entered_at: Utc::now() - chrono::Duration::hours(1),
            reason_code: ReasonCode::VixComponent,
        };
        let later = DefconState {
            level: DefconLevel::Two,
            signal_score: 74.0,
            entered_at: Utc::now(),
            reason_code: ReasonCode::NewsScore,
        };
        store.insert_defcon_state(&earlier).await.unwrap();
        store.insert_defcon_state(&later).await.unwrap();

        let latest = store.latest_defcon_state().await.unwrap().unwrap();
        assert_eq!(latest.level, DefconLevel::Two);
        assert_eq!(latest.reason_code, ReasonCode::NewsScore);
    }

    #[tokio::test]
    async fn test_orchestrator_state_round_trip() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db").to_str().unwrap())
            .await
            .unwrap();
        assert!(store.load_orchestrator_state().await.unwrap().is_none());

        store
            .save_orchestrator_state(BrokerMode::SemiAuto, 600, 42)
            .await
            .unwrap();
        let (mode, interval, count) = store.load_orchestrator_state().await.unwrap().unwrap();
        assert_eq!(mode, BrokerMode::SemiAuto);
        assert_eq!(interval, 600);
        assert_eq!(count, 42);
    }

    #[tokio::test]
    async fn test_awaiting_entry_decision() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db").to_str().unwrap())
            .await
            .unwrap();

        let decision = PendingDecision {
            id: "d-1".to_string(),
            kind: DecisionKind::Entry,
            subject: "{\"symbols\":[\"SPY\"]}".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            status: DecisionStatus::Awaiting,
        };
        store.save_decision(&decision).await.unwrap();
        assert!(store.awaiting_entry_decision().await.unwrap().is_some());

        let mut approved = decision.clone();
        approved.status = DecisionStatus::Approved;
        store.save_decision(&approved).await.unwrap();
        assert!(store.awaiting_entry_decision().await.unwrap().is_none());
    }
}
