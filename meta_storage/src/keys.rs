// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Key layout of the meta server under `storage_root_path`:
//!
//! ```text
//! <root>/clusters/<cluster_id>/meta
//! <root>/clusters/<cluster_id>/schemas/<schema_id>
//! <root>/clusters/<cluster_id>/tables/<table_id>
//! <root>/clusters/<cluster_id>/shards/<shard_id>
//! <root>/clusters/<cluster_id>/nodes/<node_name>
//! <root>/clusters/<cluster_id>/procedures/<procedure_id>
//! <root>/clusters/<cluster_id>/shard_assignments/<schema>/<table>
//! <root>/clusters/<cluster_id>/scheduler/affinities/<shard_id>
//! <root>/clusters/<cluster_id>/ids/<name>
//! <root>/ids/<name>
//! <root>/leader
//! ```
//!
//! Shard lock keys written by the storage nodes live outside the cluster
//! record space, under `<lock_root>/<cluster_name>/shards/<shard_id>`.

use common_types::{
    cluster::ClusterId, schema::SchemaId, shard::ShardId, table::TableId,
};
use snafu::ensure;

use crate::{InvalidArguments, Result};

pub fn cluster_root(root: &str, cluster_id: ClusterId) -> String {
    format!("{root}/clusters/{cluster_id}")
}

pub fn clusters_prefix(root: &str) -> String {
    format!("{root}/clusters/")
}

pub fn cluster_meta_key(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/meta", cluster_root(root, cluster_id))
}

pub fn schema_key(root: &str, cluster_id: ClusterId, schema_id: SchemaId) -> String {
    format!("{}/schemas/{schema_id}", cluster_root(root, cluster_id))
}

pub fn schema_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/schemas/", cluster_root(root, cluster_id))
}

pub fn table_key(root: &str, cluster_id: ClusterId, table_id: TableId) -> String {
    format!("{}/tables/{table_id}", cluster_root(root, cluster_id))
}

pub fn table_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/tables/", cluster_root(root, cluster_id))
}

pub fn shard_view_key(root: &str, cluster_id: ClusterId, shard_id: ShardId) -> String {
    format!("{}/shards/{shard_id}", cluster_root(root, cluster_id))
}

pub fn shard_view_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/shards/", cluster_root(root, cluster_id))
}

pub fn node_key(root: &str, cluster_id: ClusterId, node_name: &str) -> String {
    format!("{}/nodes/{node_name}", cluster_root(root, cluster_id))
}

pub fn node_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/nodes/", cluster_root(root, cluster_id))
}

pub fn procedure_key(root: &str, cluster_id: ClusterId, procedure_id: u64) -> String {
    format!("{}/procedures/{procedure_id}", cluster_root(root, cluster_id))
}

pub fn procedure_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/procedures/", cluster_root(root, cluster_id))
}

pub fn assignment_key(
    root: &str,
    cluster_id: ClusterId,
    schema_name: &str,
    table_name: &str,
) -> String {
    format!(
        "{}/shard_assignments/{schema_name}/{table_name}",
        cluster_root(root, cluster_id)
    )
}

pub fn affinity_key(root: &str, cluster_id: ClusterId, shard_id: ShardId) -> String {
    format!(
        "{}/scheduler/affinities/{shard_id}",
        cluster_root(root, cluster_id)
    )
}

pub fn affinity_prefix(root: &str, cluster_id: ClusterId) -> String {
    format!("{}/scheduler/affinities/", cluster_root(root, cluster_id))
}

pub fn cluster_id_alloc_key(root: &str, cluster_id: ClusterId, name: &str) -> String {
    format!("{}/ids/{name}", cluster_root(root, cluster_id))
}

pub fn root_id_alloc_key(root: &str, name: &str) -> String {
    format!("{root}/ids/{name}")
}

pub fn leader_key(root: &str) -> String {
    format!("{root}/leader")
}

/// Prefix of the shard lock keys taken by the storage nodes of one cluster.
///
/// A delete event under this prefix means the lock lease of the shard has
/// expired together with its holder.
pub fn shard_lock_prefix(lock_root: &str, cluster_name: &str) -> Result<String> {
    ensure!(
        lock_root.starts_with('/'),
        InvalidArguments {
            msg: "lock_root is required to start with /",
        }
    );

    ensure!(
        !cluster_name.is_empty(),
        InvalidArguments {
            msg: "cluster_name is required non-empty",
        }
    );

    const SHARD_LOCK_KEY: &str = "shards";
    Ok(format!("{lock_root}/{cluster_name}/{SHARD_LOCK_KEY}/"))
}

/// Parse the shard id out of a shard lock key.
pub fn shard_id_from_lock_key(prefix: &str, key: &str) -> Option<ShardId> {
    key.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_key_layout() {
        let cases = vec![
            (cluster_meta_key("/ceresmeta", 1), "/ceresmeta/clusters/1/meta"),
            (
                schema_key("/ceresmeta", 1, 3),
                "/ceresmeta/clusters/1/schemas/3",
            ),
            (
                table_key("/ceresmeta", 1, 42),
                "/ceresmeta/clusters/1/tables/42",
            ),
            (
                shard_view_key("/ceresmeta", 1, 7),
                "/ceresmeta/clusters/1/shards/7",
            ),
            (
                node_key("/ceresmeta", 1, "127.0.0.1:8831"),
                "/ceresmeta/clusters/1/nodes/127.0.0.1:8831",
            ),
            (
                assignment_key("/ceresmeta", 1, "public", "t1"),
                "/ceresmeta/clusters/1/shard_assignments/public/t1",
            ),
            (leader_key("/ceresmeta"), "/ceresmeta/leader"),
        ];

        for (actual, expected) in cases {
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_format_shard_lock_prefix() {
        let cases = vec![
            (
                ("/ceresdb", "defaultCluster"),
                Some("/ceresdb/defaultCluster/shards/"),
            ),
            (("", "defaultCluster"), None),
            (("vvv", "defaultCluster"), None),
            (("/x", ""), None),
        ];

        for ((lock_root, cluster_name), expected) in cases {
            let actual = shard_lock_prefix(lock_root, cluster_name);
            match expected {
                Some(expected) => assert_eq!(actual.unwrap(), expected),
                None => assert!(actual.is_err()),
            }
        }
    }

    #[test]
    fn test_shard_id_from_lock_key() {
        let prefix = shard_lock_prefix("/ceresdb", "defaultCluster").unwrap();
        assert_eq!(
            shard_id_from_lock_key(&prefix, "/ceresdb/defaultCluster/shards/3"),
            Some(3)
        );
        assert_eq!(
            shard_id_from_lock_key(&prefix, "/ceresdb/otherCluster/shards/3"),
            None
        );
    }
}
