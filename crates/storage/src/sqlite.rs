use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use haven_core::{
    validate_placement, ConstraintError, Coordinates, NewService, Region, RegionId, RegionPath,
    RegionType, Service, ServiceId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::{
    ImportWriter, RegionStore, RemovalPolicy, RemovalReport, RowCommit, RowWrite,
    ServiceCatalog, ServiceCommit, StoreError, StoreResult,
};

const SERVICE_COLUMNS: &str = "service_id, name, description, region_id, address, latitude, \
     longitude, service_type, phone, website, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url {}", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        // An in-memory database lives and dies with its connection, so it
        // gets exactly one that is never recycled.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed connecting to sqlite at {}", database_url))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS regions (
              region_id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL COLLATE NOCASE,
              region_type TEXT NOT NULL,
              parent_id INTEGER REFERENCES regions (region_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS regions_natural_key
              ON regions (name, region_type, IFNULL(parent_id, 0));
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS regions_parent ON regions (parent_id);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
              service_id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL COLLATE NOCASE,
              description TEXT NOT NULL,
              region_id INTEGER NOT NULL REFERENCES regions (region_id),
              address TEXT NOT NULL,
              latitude REAL,
              longitude REAL,
              service_type TEXT,
              phone TEXT,
              website TEXT,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS services_natural_key
              ON services (name, region_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn region_from_row(row: &SqliteRow) -> StoreResult<Region> {
    let raw_type: String = row.try_get("region_type")?;
    let region_type = RegionType::parse(&raw_type)
        .ok_or_else(|| StoreError::Decode(format!("unknown region type {raw_type:?}")))?;

    Ok(Region {
        id: RegionId(row.try_get("region_id")?),
        name: row.try_get("name")?,
        region_type,
        parent_id: row.try_get::<Option<i64>, _>("parent_id")?.map(RegionId),
    })
}

fn service_from_row(row: &SqliteRow) -> StoreResult<Service> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let coordinates = match (latitude, longitude) {
        (Some(lat), Some(lng)) => Coordinates::new(lat, lng),
        _ => None,
    };
    let raw_created: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&raw_created)
        .map_err(|err| StoreError::Decode(format!("bad created_at {raw_created:?}: {err}")))?
        .with_timezone(&Utc);

    Ok(Service {
        id: ServiceId(row.try_get("service_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        region_id: RegionId(row.try_get("region_id")?),
        address: row.try_get("address")?,
        coordinates,
        service_type: row.try_get("service_type")?,
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        created_at,
    })
}

async fn fetch_region(conn: &mut SqliteConnection, region_id: RegionId) -> StoreResult<Option<Region>> {
    let row = sqlx::query(
        r#"
        SELECT region_id, name, region_type, parent_id
        FROM regions
        WHERE region_id = ?1
        "#,
    )
    .bind(region_id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(region_from_row).transpose()
}

async fn find_region(
    conn: &mut SqliteConnection,
    name: &str,
    region_type: RegionType,
    parent_id: Option<RegionId>,
) -> StoreResult<Option<RegionId>> {
    let id: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT region_id
        FROM regions
        WHERE name = ?1 AND region_type = ?2 AND parent_id IS ?3
        "#,
    )
    .bind(name.trim())
    .bind(region_type.as_str())
    .bind(parent_id.map(|id| id.0))
    .fetch_optional(&mut *conn)
    .await?;

    Ok(id.map(RegionId))
}

async fn insert_region(
    conn: &mut SqliteConnection,
    name: &str,
    region_type: RegionType,
    parent_id: Option<RegionId>,
) -> StoreResult<RegionId> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ConstraintError::BlankName.into());
    }

    let parent = match parent_id {
        Some(id) => fetch_region(conn, id).await?,
        None => None,
    };
    validate_placement(region_type, parent_id, parent.as_ref())?;

    if let Some(existing) = find_region(conn, name, region_type, parent_id).await? {
        return Ok(existing);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO regions (name, region_type, parent_id)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(name)
    .bind(region_type.as_str())
    .bind(parent_id.map(|id| id.0))
    .execute(&mut *conn)
    .await?;

    let id = RegionId(result.last_insert_rowid());
    debug!(region_id = %id, name, region_type = %region_type, "region inserted");
    Ok(id)
}

async fn subtree(conn: &mut SqliteConnection, region_id: RegionId) -> StoreResult<Vec<RegionId>> {
    // Deepest regions come first so children can be deleted before parents.
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        WITH RECURSIVE subtree (id, depth) AS (
          SELECT region_id, 0 FROM regions WHERE region_id = ?1
          UNION ALL
          SELECT r.region_id, s.depth + 1
          FROM regions r
          JOIN subtree s ON r.parent_id = s.id
        )
        SELECT id FROM subtree ORDER BY depth DESC, id
        "#,
    )
    .bind(region_id.0)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids.into_iter().map(RegionId).collect())
}

async fn fetch_service_by_key(
    conn: &mut SqliteConnection,
    name: &str,
    region_id: RegionId,
) -> StoreResult<Option<Service>> {
    let sql = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE name = ?1 AND region_id = ?2");
    let row = sqlx::query(&sql)
        .bind(name.trim())
        .bind(region_id.0)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(service_from_row).transpose()
}

async fn insert_service(conn: &mut SqliteConnection, service: NewService) -> StoreResult<ServiceId> {
    let name = service.name.trim();
    if name.is_empty() {
        return Err(ConstraintError::BlankServiceName.into());
    }
    if fetch_region(conn, service.region_id).await?.is_none() {
        return Err(ConstraintError::RegionNotFound(service.region_id).into());
    }
    if let Some(existing) = fetch_service_by_key(conn, name, service.region_id).await? {
        return Ok(existing.id);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO services
          (name, description, region_id, address, latitude, longitude,
           service_type, phone, website, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(name)
    .bind(&service.description)
    .bind(service.region_id.0)
    .bind(&service.address)
    .bind(service.coordinates.map(|c| c.latitude))
    .bind(service.coordinates.map(|c| c.longitude))
    .bind(&service.service_type)
    .bind(&service.phone)
    .bind(&service.website)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(ServiceId(result.last_insert_rowid()))
}

async fn backfill(
    conn: &mut SqliteConnection,
    service_id: ServiceId,
    coordinates: Coordinates,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE services
        SET latitude = ?2, longitude = ?3
        WHERE service_id = ?1 AND (latitude IS NULL OR longitude IS NULL)
        "#,
    )
    .bind(service_id.0)
    .bind(coordinates.latitude)
    .bind(coordinates.longitude)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn apply_row(conn: &mut SqliteConnection, row: &RowWrite) -> StoreResult<RowCommit> {
    let mut regions = Vec::with_capacity(row.path.len());
    let mut parent = None;
    for (region_type, name) in row.path.levels() {
        let id = insert_region(conn, name, region_type, parent).await?;
        regions.push(id);
        parent = Some(id);
    }

    let (Some(leaf), Some(draft)) = (parent, row.service.as_ref()) else {
        return Ok(RowCommit {
            regions,
            service: None,
        });
    };

    let commit = match fetch_service_by_key(conn, &draft.name, leaf).await? {
        Some(existing) => {
            let located = match draft.coordinates {
                Some(coordinates) => backfill(conn, existing.id, coordinates).await?,
                None => false,
            };
            if located {
                ServiceCommit::Backfilled(existing.id)
            } else {
                ServiceCommit::Existing(existing.id)
            }
        }
        None => ServiceCommit::Inserted(
            insert_service(conn, draft.clone().into_new_service(leaf)).await?,
        ),
    };

    Ok(RowCommit {
        regions,
        service: Some(commit),
    })
}

impl RegionStore for SqliteStore {
    async fn insert_region(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<RegionId> {
        let mut tx = self.pool.begin().await?;
        let id = insert_region(&mut tx, name, region_type, parent_id).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_region(&self, region_id: RegionId) -> StoreResult<Option<Region>> {
        let mut conn = self.pool.acquire().await?;
        fetch_region(&mut conn, region_id).await
    }

    async fn get_path(&self, region_id: RegionId) -> StoreResult<Vec<Region>> {
        let mut conn = self.pool.acquire().await?;
        let mut chain = Vec::new();
        let mut cursor = Some(region_id);

        while let Some(id) = cursor {
            let region = fetch_region(&mut conn, id)
                .await?
                .ok_or(ConstraintError::RegionNotFound(id))?;
            cursor = region.parent_id;
            chain.push(region);
        }

        chain.reverse();
        Ok(chain)
    }

    async fn find_by_type_and_parent(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<Option<RegionId>> {
        let mut conn = self.pool.acquire().await?;
        find_region(&mut conn, name, region_type, parent_id).await
    }

    async fn query_descendants(&self, region_id: RegionId) -> StoreResult<BTreeSet<RegionId>> {
        let mut conn = self.pool.acquire().await?;
        Ok(subtree(&mut conn, region_id).await?.into_iter().collect())
    }

    async fn list_regions(&self) -> StoreResult<Vec<Region>> {
        let rows = sqlx::query(
            r#"
            SELECT region_id, name, region_type, parent_id
            FROM regions
            ORDER BY region_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(region_from_row).collect()
    }

    async fn find_region_by_path(&self, path: &RegionPath) -> StoreResult<Option<Region>> {
        let mut conn = self.pool.acquire().await?;
        let mut parent = None;
        for (region_type, name) in path.levels() {
            match find_region(&mut conn, name, region_type, parent).await? {
                Some(id) => parent = Some(id),
                None => return Ok(None),
            }
        }

        match parent {
            Some(id) => fetch_region(&mut conn, id).await,
            None => Ok(None),
        }
    }

    async fn remove_region(
        &self,
        region_id: RegionId,
        policy: RemovalPolicy,
    ) -> StoreResult<RemovalReport> {
        let mut tx = self.pool.begin().await?;
        if fetch_region(&mut tx, region_id).await?.is_none() {
            return Err(ConstraintError::RegionNotFound(region_id).into());
        }

        let regions = subtree(&mut tx, region_id).await?;
        let mut services = 0_usize;
        for id in &regions {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE region_id = ?1")
                .bind(id.0)
                .fetch_one(&mut *tx)
                .await?;
            services += count as usize;
        }

        if policy == RemovalPolicy::Restrict && (regions.len() > 1 || services > 0) {
            return Err(ConstraintError::RegionHasDependents {
                region: region_id,
                child_regions: regions.len() - 1,
                services,
            }
            .into());
        }

        for id in &regions {
            sqlx::query("DELETE FROM services WHERE region_id = ?1")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM regions WHERE region_id = ?1")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(RemovalReport {
            regions_removed: regions.len(),
            services_removed: services,
        })
    }
}

impl ServiceCatalog for SqliteStore {
    async fn insert_service(&self, service: NewService) -> StoreResult<ServiceId> {
        let mut tx = self.pool.begin().await?;
        let id = insert_service(&mut tx, service).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_service(&self, service_id: ServiceId) -> StoreResult<Option<Service>> {
        let sql = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE service_id = ?1");
        let row = sqlx::query(&sql)
            .bind(service_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(service_from_row).transpose()
    }

    async fn find_service(&self, name: &str, region_id: RegionId) -> StoreResult<Option<Service>> {
        let mut conn = self.pool.acquire().await?;
        fetch_service_by_key(&mut conn, name, region_id).await
    }

    async fn query_services(&self, region_id: RegionId, recursive: bool) -> StoreResult<Vec<Service>> {
        let sql = if recursive {
            format!(
                r#"
                WITH RECURSIVE subtree (id) AS (
                  SELECT region_id FROM regions WHERE region_id = ?1
                  UNION ALL
                  SELECT r.region_id FROM regions r JOIN subtree s ON r.parent_id = s.id
                )
                SELECT {SERVICE_COLUMNS}
                FROM services
                WHERE region_id IN (SELECT id FROM subtree)
                ORDER BY service_id
                "#
            )
        } else {
            format!(
                "SELECT {SERVICE_COLUMNS} FROM services WHERE region_id = ?1 ORDER BY service_id"
            )
        };

        let rows = sqlx::query(&sql)
            .bind(region_id.0)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(service_from_row).collect()
    }

    async fn list_services(&self, service_type: Option<&str>) -> StoreResult<Vec<Service>> {
        let sql = format!(
            "SELECT {SERVICE_COLUMNS} FROM services \
             WHERE ?1 IS NULL OR service_type = ?1 COLLATE NOCASE \
             ORDER BY service_id"
        );
        let rows = sqlx::query(&sql)
            .bind(service_type)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(service_from_row).collect()
    }

    async fn service_types(&self) -> StoreResult<Vec<String>> {
        let types: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT service_type
            FROM services
            WHERE service_type IS NOT NULL
            ORDER BY service_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(types)
    }

    async fn remove_service(&self, service_id: ServiceId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM services WHERE service_id = ?1")
            .bind(service_id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn backfill_coordinates(
        &self,
        service_id: ServiceId,
        coordinates: Coordinates,
    ) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        backfill(&mut conn, service_id, coordinates).await
    }
}

impl ImportWriter for SqliteStore {
    async fn commit_row(&self, row: &RowWrite) -> StoreResult<RowCommit> {
        let mut tx = self.pool.begin().await?;
        // Dropping an uncommitted transaction rolls it back.
        let commit = apply_row(&mut tx, row).await?;
        tx.commit().await?;
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceDraft;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn path_follows_type_order() {
        let store = store().await;
        let ca = store
            .insert_region("CA", RegionType::Country, None)
            .await
            .unwrap();
        let bc = store
            .insert_region("BC", RegionType::Province, Some(ca))
            .await
            .unwrap();
        let fv = store
            .insert_region("Fraser Valley", RegionType::County, Some(bc))
            .await
            .unwrap();
        let mission = store
            .insert_region("Mission", RegionType::City, Some(fv))
            .await
            .unwrap();

        let path = store.get_path(mission).await.unwrap();
        let types = path.iter().map(|r| r.region_type).collect::<Vec<_>>();
        assert_eq!(types, RegionType::ALL);
        assert_eq!(path[0].id, ca);

        let again = store
            .insert_region("mission", RegionType::City, Some(fv))
            .await
            .unwrap();
        assert_eq!(again, mission);

        let descendants = store.query_descendants(bc).await.unwrap();
        assert_eq!(descendants, BTreeSet::from([bc, fv, mission]));
    }

    #[tokio::test]
    async fn rejects_city_under_country() {
        let store = store().await;
        let uk = store
            .insert_region("UK", RegionType::Country, None)
            .await
            .unwrap();
        assert_eq!(uk, RegionId(1));

        let err = store
            .insert_region("London", RegionType::City, Some(uk))
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_constraint(),
            Some(ConstraintError::ParentTypeMismatch { .. })
        ));

        let err = store
            .insert_service(NewService::new("Clinic", "", RegionId(42), "nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_constraint(),
            Some(ConstraintError::RegionNotFound(RegionId(42)))
        ));
    }

    #[tokio::test]
    async fn failed_row_rolls_back() {
        let store = store().await;
        let row = RowWrite {
            path: RegionPath::from_levels(&[Some("CA"), Some("YT")]).unwrap(),
            service: Some(ServiceDraft {
                name: " ".to_string(),
                description: String::new(),
                address: "Whitehorse".to_string(),
                coordinates: None,
                service_type: None,
                phone: None,
                website: None,
            }),
        };

        assert!(store.commit_row(&row).await.is_err());
        assert!(store.list_regions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recursive_query_spans_subtree() {
        let store = store().await;
        let row = |city: &str, service: &str| RowWrite {
            path: RegionPath::from_levels(&[Some("CA"), Some("BC"), Some("Metro Vancouver"), Some(city)])
                .unwrap(),
            service: Some(ServiceDraft {
                name: service.to_string(),
                description: "speech therapy".to_string(),
                address: format!("1 Main St, {city}"),
                coordinates: Coordinates::new(49.1, -122.6),
                service_type: Some("Education".to_string()),
                phone: None,
                website: None,
            }),
        };

        let langley = store.commit_row(&row("Langley", "Access Learning")).await.unwrap();
        store.commit_row(&row("Burnaby", "ABC Solutions Inc.")).await.unwrap();

        let province = langley.regions[1];
        let all = store.query_services(province, true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.query_services(province, false).await.unwrap().is_empty());
        assert_eq!(store.service_types().await.unwrap(), ["Education"]);
        assert_eq!(store.list_services(Some("education")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cascade_removal_clears_subtree() {
        let store = store().await;
        let commit = store
            .commit_row(&RowWrite {
                path: RegionPath::from_levels(&[Some("CA"), Some("NL")]).unwrap(),
                service: Some(ServiceDraft {
                    name: "Goose Bay Clinic".to_string(),
                    description: String::new(),
                    address: "Happy Valley-Goose Bay".to_string(),
                    coordinates: None,
                    service_type: None,
                    phone: None,
                    website: None,
                }),
            })
            .await
            .unwrap();

        let root = commit.regions[0];
        assert!(store.remove_region(root, RemovalPolicy::Restrict).await.is_err());

        let report = store.remove_region(root, RemovalPolicy::Cascade).await.unwrap();
        assert_eq!(report.regions_removed, 2);
        assert_eq!(report.services_removed, 1);
        assert!(store.list_regions().await.unwrap().is_empty());
    }
}
