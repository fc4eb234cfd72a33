use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info};

use super::ResourceStore;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::model::{
    BackendKind, ClusterNode, Demand, Flavor, Image, NewVm, Resources, SliceRecord, VmRecord,
    VmState, Worker,
};

/// Advisory lock key that serializes VLAN id allocation across processes.
const VLAN_LOCK_KEY: i64 = 0x736c_6963_6572;

const WORKER_COLUMNS: &str = "w.id, w.name, z.name AS zone, \
     w.ram_total, w.disk_total, w.vcpu_total, \
     w.ram_avail, w.disk_avail, w.vcpu_avail, w.max_display_port";

#[derive(FromRow)]
struct WorkerRow {
    id: i64,
    name: String,
    zone: String,
    ram_total: f64,
    disk_total: f64,
    vcpu_total: f64,
    ram_avail: f64,
    disk_avail: f64,
    vcpu_avail: f64,
    max_display_port: Option<i32>,
}

impl From<WorkerRow> for Worker {
    fn from(row: WorkerRow) -> Self {
        Worker {
            id: row.id,
            name: row.name,
            zone: row.zone,
            capacity: Resources::new(row.ram_total, row.disk_total, row.vcpu_total),
            headroom: Resources::new(row.ram_avail, row.disk_avail, row.vcpu_avail),
            max_display_port: row.max_display_port,
        }
    }
}

#[derive(FromRow)]
struct FlavorRow {
    id: i64,
    name: String,
    vcpu: i32,
    ram: i64,
    disk: i64,
}

impl From<FlavorRow> for Flavor {
    fn from(row: FlavorRow) -> Self {
        Flavor {
            id: row.id,
            name: row.name,
            demand: Demand {
                vcpu: row.vcpu.max(0) as u32,
                ram: row.ram.max(0) as u64,
                disk: row.disk.max(0) as u64,
            },
        }
    }
}

#[derive(FromRow)]
struct ImageRow {
    id: i64,
    name: String,
    url: Option<String>,
}

impl From<ImageRow> for Image {
    fn from(row: ImageRow) -> Self {
        Image {
            id: row.id,
            name: row.name,
            url: row.url,
        }
    }
}

#[derive(FromRow)]
struct SliceRow {
    id: i64,
    name: String,
    backend: String,
    zone: String,
    vlan_id: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<SliceRow> for SliceRecord {
    type Error = StoreError;

    fn try_from(row: SliceRow) -> Result<Self, Self::Error> {
        let backend = BackendKind::parse(&row.backend).ok_or_else(|| {
            StoreError::Corrupt(format!("slice {} has backend {}", row.name, row.backend))
        })?;
        Ok(SliceRecord {
            id: row.id,
            name: row.name,
            backend,
            zone: row.zone,
            vlan_id: row.vlan_id,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct VmRow {
    id: i64,
    name: String,
    state: String,
    worker_id: i64,
    display_port: Option<i32>,
    vcpu: i32,
    ram: i64,
    disk: i64,
}

impl From<VmRow> for VmRecord {
    fn from(row: VmRow) -> Self {
        VmRecord {
            id: row.id,
            name: row.name,
            state: VmState::parse(&row.state),
            worker_id: row.worker_id,
            display_port: row.display_port,
            demand: Demand {
                vcpu: row.vcpu.max(0) as u32,
                ram: row.ram.max(0) as u64,
                disk: row.disk.max(0) as u64,
            },
        }
    }
}

/// Converts a request figure to its column type, refusing values the
/// column cannot hold.
fn db_int<T: TryFrom<u64>>(column: &str, value: u64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} {value} out of range")))
}

/// PostgreSQL-backed store. Every statement binds its values; each
/// multi-row write runs in its own transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!("Connected to resource database");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn zone_id(tx: &mut Transaction<'_, Postgres>, zone: &str) -> Result<i64, StoreError> {
        let id: (i64,) = sqlx::query_as(
            "INSERT INTO inventory.zone (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id",
        )
        .bind(zone)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id.0)
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn workers_in_zone(&self, zone: &str) -> Result<Vec<Worker>, StoreError> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM inventory.worker w \
             JOIN inventory.zone z ON z.id = w.zone_id \
             WHERE z.name = $1 ORDER BY w.id"
        );
        let rows: Vec<WorkerRow> = sqlx::query_as(&sql).bind(zone).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Worker::from).collect())
    }

    async fn worker(&self, id: i64) -> Result<Worker, StoreError> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM inventory.worker w \
             JOIN inventory.zone z ON z.id = w.zone_id WHERE w.id = $1"
        );
        let row: Option<WorkerRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(Worker::from).ok_or(StoreError::UnknownWorker(id))
    }

    async fn flavor_by_name(&self, name: &str) -> Result<Option<Flavor>, StoreError> {
        let row: Option<FlavorRow> = sqlx::query_as(
            "SELECT id, name, vcpu, ram, disk FROM inventory.flavor WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Flavor::from))
    }

    async fn image_by_name(&self, name: &str) -> Result<Option<Image>, StoreError> {
        let row: Option<ImageRow> =
            sqlx::query_as("SELECT id, name, url FROM inventory.image WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Image::from))
    }

    async fn create_image(&self, name: &str, url: &str) -> Result<Image, StoreError> {
        let row: Option<ImageRow> = sqlx::query_as(
            "INSERT INTO inventory.image (name, url) VALUES ($1, $2) \
             ON CONFLICT (name) DO NOTHING RETURNING id, name, url",
        )
        .bind(name)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Image::from)
            .ok_or_else(|| StoreError::Duplicate(format!("image {name}")))
    }

    async fn slice(&self, name: &str) -> Result<Option<SliceRecord>, StoreError> {
        let row: Option<SliceRow> = sqlx::query_as(
            "SELECT id, name, backend, zone, vlan_id, created_at \
             FROM inventory.slice WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SliceRecord::try_from).transpose()
    }

    async fn max_vlan_id(&self) -> Result<Option<i32>, StoreError> {
        let max: (Option<i32>,) = sqlx::query_as("SELECT MAX(vlan_id) FROM inventory.slice")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.0)
    }

    async fn ensure_slice(
        &self,
        name: &str,
        backend: BackendKind,
        zone: &str,
    ) -> Result<SliceRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(VLAN_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let existing: Option<SliceRow> = sqlx::query_as(
            "SELECT id, name, backend, zone, vlan_id, created_at \
             FROM inventory.slice WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            return SliceRecord::try_from(row);
        }

        let row: SliceRow = sqlx::query_as(
            "INSERT INTO inventory.slice (name, backend, zone, vlan_id) \
             SELECT $1, $2, $3, COALESCE(MAX(vlan_id), 0) + 1 FROM inventory.slice \
             RETURNING id, name, backend, zone, vlan_id, created_at",
        )
        .bind(name)
        .bind(backend.as_str())
        .bind(zone)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Registered slice {} with VLAN {}", row.name, row.vlan_id);
        SliceRecord::try_from(row)
    }

    async fn record_vm(&self, vm: &NewVm) -> Result<VmRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let slice_id: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM inventory.slice WHERE name = $1")
                .bind(&vm.slice_name)
                .fetch_optional(&mut *tx)
                .await?;
        let (slice_id,) = slice_id.ok_or_else(|| StoreError::UnknownSlice(vm.slice_name.clone()))?;

        let ram = db_int::<i64>("ram", vm.demand.ram)?;
        let disk = db_int::<i64>("disk", vm.demand.disk)?;
        let vcpu = db_int::<i32>("vcpu", u64::from(vm.demand.vcpu))?;

        let avail: Option<(f64, f64, f64)> = sqlx::query_as(
            "SELECT ram_avail, disk_avail, vcpu_avail FROM inventory.worker \
             WHERE id = $1 FOR UPDATE",
        )
        .bind(vm.worker_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (ram_avail, disk_avail, vcpu_avail) =
            avail.ok_or(StoreError::UnknownWorker(vm.worker_id))?;
        let taken = vm.reserved.min(Resources::new(ram_avail, disk_avail, vcpu_avail));

        sqlx::query(
            "UPDATE inventory.worker SET \
                 ram_avail = ram_avail - $2, \
                 disk_avail = disk_avail - $3, \
                 vcpu_avail = vcpu_avail - $4, \
                 max_display_port = CASE WHEN $5::INTEGER IS NULL THEN max_display_port \
                     ELSE GREATEST(COALESCE(max_display_port, $5), $5) END, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(vm.worker_id)
        .bind(taken.ram)
        .bind(taken.disk)
        .bind(taken.vcpu)
        .bind(vm.display_port)
        .execute(&mut *tx)
        .await?;

        let (resources_id,): (i64,) = sqlx::query_as(
            "INSERT INTO inventory.resources \
                 (ram, disk, vcpu, reserved_ram, reserved_disk, reserved_vcpu) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(ram)
        .bind(disk)
        .bind(vcpu)
        .bind(taken.ram)
        .bind(taken.disk)
        .bind(taken.vcpu)
        .fetch_one(&mut *tx)
        .await?;

        let vm_id: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO inventory.vm \
                 (name, state, display_port, worker_id, slice_id, image_id, resources_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (name) DO NOTHING RETURNING id",
        )
        .bind(&vm.name)
        .bind(VmState::Active.as_str())
        .bind(vm.display_port)
        .bind(vm.worker_id)
        .bind(slice_id)
        .bind(vm.image_id)
        .bind(resources_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (vm_id,) = vm_id.ok_or_else(|| StoreError::Duplicate(format!("vm {}", vm.name)))?;

        let (node_id,): (i64,) = sqlx::query_as(
            "INSERT INTO cluster.node (name, display_port) VALUES ($1, $2) RETURNING id",
        )
        .bind(&vm.name)
        .bind(vm.display_port)
        .fetch_one(&mut *tx)
        .await?;
        for link in &vm.links {
            sqlx::query("INSERT INTO cluster.link (name, node_id) VALUES ($1, $2)")
                .bind(link)
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO cluster.ram (total, node_id) VALUES ($1, $2)")
            .bind(ram)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO cluster.disk (total, node_id) VALUES ($1, $2)")
            .bind(disk)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO cluster.vcpu (total, node_id) VALUES ($1, $2)")
            .bind(vcpu)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Recorded VM {} on worker {}", vm.name, vm.worker_id);

        Ok(VmRecord {
            id: vm_id,
            name: vm.name.clone(),
            state: VmState::Active,
            worker_id: vm.worker_id,
            display_port: vm.display_port,
            demand: vm.demand,
        })
    }

    async fn slice_vms(&self, slice_name: &str) -> Result<Vec<VmRecord>, StoreError> {
        let rows: Vec<VmRow> = sqlx::query_as(
            "SELECT v.id, v.name, v.state, v.worker_id, v.display_port, \
                    r.vcpu, r.ram, r.disk \
             FROM inventory.vm v \
             JOIN inventory.slice s ON s.id = v.slice_id \
             JOIN inventory.resources r ON r.id = v.resources_id \
             WHERE s.name = $1 ORDER BY v.id",
        )
        .bind(slice_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(VmRecord::from).collect())
    }

    async fn set_vm_state(&self, vm_name: &str, state: VmState) -> Result<(), StoreError> {
        sqlx::query("UPDATE inventory.vm SET state = $2 WHERE name = $1")
            .bind(vm_name)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cluster_node(&self, vm_name: &str) -> Result<Option<ClusterNode>, StoreError> {
        let node: Option<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM cluster.node WHERE name = $1")
                .bind(vm_name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((id, name)) = node else {
            return Ok(None);
        };
        let links: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM cluster.link WHERE node_id = $1 ORDER BY id")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(Some(ClusterNode {
            id,
            name,
            links: links.into_iter().map(|(link,)| link).collect(),
        }))
    }

    async fn remove_vm(&self, vm_name: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let vm: Option<(i64, i64, f64, f64, f64)> = sqlx::query_as(
            "SELECT v.worker_id, v.resources_id, \
                    r.reserved_ram, r.reserved_disk, r.reserved_vcpu \
             FROM inventory.vm v JOIN inventory.resources r ON r.id = v.resources_id \
             WHERE v.name = $1 FOR UPDATE OF v",
        )
        .bind(vm_name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((worker_id, resources_id, ram, disk, vcpu)) = vm else {
            tx.commit().await?;
            return Ok(());
        };

        sqlx::query(
            "UPDATE inventory.worker SET \
                 ram_avail = LEAST(ram_avail + $2, ram_total), \
                 disk_avail = LEAST(disk_avail + $3, disk_total), \
                 vcpu_avail = LEAST(vcpu_avail + $4, vcpu_total), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(worker_id)
        .bind(ram)
        .bind(disk)
        .bind(vcpu)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM inventory.vm WHERE name = $1")
            .bind(vm_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM inventory.resources WHERE id = $1")
            .bind(resources_id)
            .execute(&mut *tx)
            .await?;

        let node: Option<(i64,)> = sqlx::query_as("SELECT id FROM cluster.node WHERE name = $1")
            .bind(vm_name)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some((node_id,)) = node {
            for table in ["cluster.link", "cluster.ram", "cluster.disk", "cluster.vcpu"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE node_id = $1"))
                    .bind(node_id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM cluster.node WHERE id = $1")
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("Removed VM {} and released its reservation", vm_name);
        Ok(())
    }

    async fn delete_slice(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inventory.slice WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_hypervisor(
        &self,
        zone: &str,
        name: &str,
        capacity: Resources,
        headroom: Resources,
    ) -> Result<Worker, StoreError> {
        let mut tx = self.pool.begin().await?;
        let zone_id = Self::zone_id(&mut tx, zone).await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO inventory.worker \
                 (name, zone_id, ram_total, disk_total, vcpu_total, \
                  ram_avail, disk_avail, vcpu_avail) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (name) DO UPDATE SET \
                 zone_id = EXCLUDED.zone_id, \
                 ram_total = EXCLUDED.ram_total, \
                 disk_total = EXCLUDED.disk_total, \
                 vcpu_total = EXCLUDED.vcpu_total, \
                 ram_avail = EXCLUDED.ram_avail, \
                 disk_avail = EXCLUDED.disk_avail, \
                 vcpu_avail = EXCLUDED.vcpu_avail, \
                 updated_at = now() \
             RETURNING id",
        )
        .bind(name)
        .bind(zone_id)
        .bind(capacity.ram)
        .bind(capacity.disk)
        .bind(capacity.vcpu)
        .bind(headroom.ram.min(capacity.ram))
        .bind(headroom.disk.min(capacity.disk))
        .bind(headroom.vcpu.min(capacity.vcpu))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        self.worker(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_figures_are_refused() {
        assert_eq!(db_int::<i64>("ram", 2048).unwrap(), 2048);
        assert!(matches!(db_int::<i64>("ram", u64::MAX), Err(StoreError::Corrupt(_))));
        assert!(matches!(
            db_int::<i32>("vcpu", u64::from(u32::MAX)),
            Err(StoreError::Corrupt(_))
        ));
    }
}
