//! Map persistence.
//!
//! The daemon saves its address and a full map snapshot to a local sqlite
//! database on shutdown and reloads them at boot, so a restarted node
//! re-enters the network with warm maps instead of hooking from scratch.

use crate::addr::{AddrFamily, HierAddr};
use crate::error::MeshResult;
use crate::map::{BorderSnapshot, EntitySnapshot, MapSnapshot};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Sqlite-backed snapshot store.
pub struct MapDb {
    conn: Connection,
}

impl MapDb {
    /// Open (or create) the database at `path`. `:memory:` works for tests.
    pub fn open(path: &str) -> MeshResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS entities (
                 level          INTEGER NOT NULL,
                 id             INTEGER NOT NULL,
                 flags          INTEGER NOT NULL,
                 broadcast_seen INTEGER NOT NULL,
                 seeds          INTEGER NOT NULL,
                 gateways       TEXT NOT NULL,
                 PRIMARY KEY (level, id)
             );
             CREATE TABLE IF NOT EXISTS borders (
                 level     INTEGER NOT NULL,
                 id        INTEGER NOT NULL,
                 upper_gid INTEGER NOT NULL,
                 rtt_ms    INTEGER NOT NULL,
                 PRIMARY KEY (level, id, upper_gid)
             );",
        )?;
        Ok(Self { conn })
    }

    /// Replace the stored state with `addr` and `snapshot`.
    pub fn save(&mut self, addr: &HierAddr, snapshot: &MapSnapshot) -> MeshResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM meta", [])?;
        tx.execute("DELETE FROM entities", [])?;
        tx.execute("DELETE FROM borders", [])?;

        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('addr', ?1)",
            params![serde_json::to_string(addr)?],
        )?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('family', ?1)",
            params![serde_json::to_string(&snapshot.family)?],
        )?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO entities (level, id, flags, broadcast_seen, seeds, gateways)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (level, entries) in snapshot.levels.iter().enumerate() {
                for entry in entries {
                    insert.execute(params![
                        level as i64,
                        entry.id as i64,
                        entry.flags as i64,
                        entry.broadcast_seen as i64,
                        entry.seeds as i64,
                        serde_json::to_string(&entry.gateways)?,
                    ])?;
                }
            }
        }
        {
            let mut insert = tx.prepare(
                "INSERT INTO borders (level, id, upper_gid, rtt_ms) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for row in &snapshot.borders {
                insert.execute(params![
                    row.level as i64,
                    row.id as i64,
                    row.upper_gid as i64,
                    row.rtt_ms as i64,
                ])?;
            }
        }

        tx.commit()?;
        info!("map snapshot saved");
        Ok(())
    }

    /// Load the stored address and snapshot, or `None` when the database is
    /// fresh.
    pub fn load(&self) -> MeshResult<Option<(HierAddr, MapSnapshot)>> {
        let addr: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'addr'", [], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(addr_json) = addr else {
            return Ok(None);
        };
        let addr: HierAddr = serde_json::from_str(&addr_json)?;

        let family_json: String =
            self.conn
                .query_row("SELECT value FROM meta WHERE key = 'family'", [], |row| {
                    row.get(0)
                })?;
        let family: AddrFamily = serde_json::from_str(&family_json)?;

        let mut levels: Vec<Vec<EntitySnapshot>> =
            (0..family.levels()).map(|_| Vec::new()).collect();
        {
            let mut stmt = self.conn.prepare(
                "SELECT level, id, flags, broadcast_seen, seeds, gateways
                 FROM entities ORDER BY level, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)? as usize,
                    EntitySnapshot {
                        id: row.get::<_, i64>(1)? as u8,
                        flags: row.get::<_, i64>(2)? as u16,
                        broadcast_seen: row.get::<_, i64>(3)? as u32,
                        seeds: row.get::<_, i64>(4)? as u16,
                        gateways: Vec::new(),
                    },
                    row.get::<_, String>(5)?,
                ))
            })?;
            for row in rows {
                let (level, mut entry, gateways_json) = row?;
                entry.gateways = serde_json::from_str(&gateways_json)?;
                if level < levels.len() {
                    levels[level].push(entry);
                }
            }
        }

        let mut borders = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT level, id, upper_gid, rtt_ms FROM borders")?;
            let rows = stmt.query_map([], |row| {
                Ok(BorderSnapshot {
                    level: row.get::<_, i64>(0)? as u8,
                    id: row.get::<_, i64>(1)? as u8,
                    upper_gid: row.get::<_, i64>(2)? as u8,
                    rtt_ms: row.get::<_, i64>(3)? as u32,
                })
            })?;
            for row in rows {
                borders.push(row?);
            }
        }

        Ok(Some((
            addr,
            MapSnapshot {
                family,
                levels,
                borders,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{EntityKey, Gateway, MapStore};
    use crate::ranking::arrival_mask;

    #[test]
    fn test_fresh_database_loads_nothing() {
        let db = MapDb::open(":memory:").unwrap();
        assert!(db.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let addr = HierAddr::new(AddrFamily::Ipv4, vec![7, 2, 3, 4, 5]).unwrap();
        let mut store = MapStore::new(AddrFamily::Ipv4);
        store.init_self(&addr);
        store.upsert_gateway(
            EntityKey::new(0, 3),
            Gateway {
                target: EntityKey::new(0, 3),
                link_rtt_ms: 10,
                total_rtt_ms: 10,
                route_mask: arrival_mask([3]),
            },
        );
        store.set_group_occupancy(1, 2, 9);
        store.border_link(0, 3, 8, 25);

        let mut db = MapDb::open(":memory:").unwrap();
        db.save(&addr, &store.snapshot()).unwrap();

        let (loaded_addr, loaded) = db.load().unwrap().unwrap();
        assert_eq!(loaded_addr, addr);

        let restored = MapStore::from_snapshot(&loaded);
        assert_eq!(
            restored.entity(EntityKey::new(0, 3)).gateways,
            store.entity(EntityKey::new(0, 3)).gateways
        );
        assert_eq!(restored.group(EntityKey::new(1, 2)).unwrap().seeds, 9);
        assert!(restored.borders(0).is_border(3));
    }

    #[test]
    fn test_save_replaces_previous_state() {
        let addr = HierAddr::new(AddrFamily::Ipv4, vec![7, 2, 3, 4, 5]).unwrap();
        let mut store = MapStore::new(AddrFamily::Ipv4);
        store.init_self(&addr);

        let mut db = MapDb::open(":memory:").unwrap();
        db.save(&addr, &store.snapshot()).unwrap();

        let moved = HierAddr::new(AddrFamily::Ipv4, vec![8, 2, 3, 4, 5]).unwrap();
        let mut store = MapStore::new(AddrFamily::Ipv4);
        store.init_self(&moved);
        db.save(&moved, &store.snapshot()).unwrap();

        let (loaded_addr, loaded) = db.load().unwrap().unwrap();
        assert_eq!(loaded_addr, moved);
        assert!(loaded.levels[0].iter().any(|e| e.id == 8));
        assert!(!loaded.levels[0].iter().any(|e| e.id == 7));
    }
}
