/*
    Developer blog:
    - Version id used to be the file's modified date. That works when every node reads the same network
    share, but a copied file keeps no such guarantee, so pushed files are versioned by content hash now.
    - Sync is fan out / await all. One slow node holds up the total, but one broken node never keeps
    the others from being marked synced.
    - A task is bound to the version it was created with. The bytes read at sync time are hashed again and
    refused when the file moved on since, otherwise nodes would store the edit under the old version.
*/
use crate::models::{
    error::FarmError,
    message::{SyncPayload, SyncSource},
    project_file::ProjectFile,
    render_node::RenderNode,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures::future::join_all;
use std::{
    io::{Read, Write},
    path::Path,
    sync::Arc,
    time::UNIX_EPOCH,
};

/// Outcome of syncing one node.
#[derive(Debug)]
pub struct SyncReport {
    pub node: String,
    pub result: Result<(), FarmError>,
}

impl SyncReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Content hash for pushed files, modified time and size for files read off a network share.
pub async fn compute_file_version(path: &Path, networked: bool) -> Result<String, FarmError> {
    if networked {
        let meta = tokio::fs::metadata(path).await?;
        let modified = meta.modified()?.duration_since(UNIX_EPOCH).unwrap_or_default();
        return Ok(format!("mt:{}.{:09}:{}", modified.as_secs(), modified.subsec_nanos(), meta.len()));
    }

    let data = tokio::fs::read(path).await?;
    tokio::task::spawn_blocking(move || content_version(&data))
        .await
        .map_err(|e| FarmError::Io(std::io::Error::other(e)))
}

fn content_version(data: &[u8]) -> String {
    format!("b3:{}", blake3::hash(data).to_hex())
}

pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileSynchronizer;

impl FileSynchronizer {
    /// Recompute the version of the project's file. Returns the new id and whether it changed.
    /// A change resets the sync flag of every given node for this session.
    pub async fn update_file_version(
        &self,
        project: &mut ProjectFile,
        nodes: &[Arc<RenderNode>],
    ) -> Result<(String, bool), FarmError> {
        let version = compute_file_version(&project.blend_file, project.options.use_networked_path).await?;
        let changed = project.file_version.as_deref() != Some(version.as_str());
        if changed {
            tracing::debug!("{:?} is now at version {version}", project.blend_file);
            for node in nodes {
                node.mark_synced(project.session_id, false);
            }
            project.file_version = Some(version.clone());
        }
        Ok((version, changed))
    }

    /// Bring every connected node that is not synced for this session up to `version`.
    /// Nodes already synced are reported as success without a call.
    pub async fn sync(&self, project: &ProjectFile, version: &str, nodes: &[Arc<RenderNode>]) -> Vec<SyncReport> {
        let pending: Vec<&Arc<RenderNode>> = nodes
            .iter()
            .filter(|n| !n.is_session_synced(&project.session_id))
            .collect();
        let mut reports: Vec<SyncReport> = nodes
            .iter()
            .filter(|n| n.is_session_synced(&project.session_id))
            .map(|n| SyncReport {
                node: n.name.clone(),
                result: Ok(()),
            })
            .collect();
        if pending.is_empty() {
            return reports;
        }

        if project.options.use_networked_path {
            reports.extend(self.sync_network(project, version, &pending).await);
        } else {
            reports.extend(self.sync_bytes(project, version, &pending).await);
        }
        reports
    }

    async fn sync_bytes(&self, project: &ProjectFile, version: &str, nodes: &[&Arc<RenderNode>]) -> Vec<SyncReport> {
        let compressed = project.options.use_sync_compression;
        // read and compress once, every node gets the same payload.
        let data = match self.load(&project.blend_file, version, compressed).await {
            Ok(data) => data,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!("Unable to sync {:?}: {reason}", project.blend_file);
                return nodes
                    .iter()
                    .map(|n| {
                        n.mark_synced(project.session_id, false);
                        SyncReport {
                            node: n.name.clone(),
                            result: Err(FarmError::sync(&n.name, &reason)),
                        }
                    })
                    .collect();
            }
        };

        let payload = SyncPayload {
            session_id: project.session_id,
            file_version: version.to_owned(),
            file_name: project.file_name(),
            source: SyncSource::Bytes { data, compressed },
        };
        join_all(nodes.iter().map(|node| self.sync_node(project, node, payload.clone()))).await
    }

    async fn sync_network(&self, project: &ProjectFile, version: &str, nodes: &[&Arc<RenderNode>]) -> Vec<SyncReport> {
        join_all(nodes.iter().map(|node| {
            let os = node.spec().map(|s| s.os).unwrap_or_else(crate::models::computer_spec::NodeOs::current);
            let path = project.options.network_paths.for_os(os).map(str::to_owned);
            async move {
                match path {
                    Some(path) => {
                        let payload = SyncPayload {
                            session_id: project.session_id,
                            file_version: version.to_owned(),
                            file_name: project.file_name(),
                            source: SyncSource::NetworkPath(path),
                        };
                        self.sync_node(project, node, payload).await
                    }
                    None => {
                        node.mark_synced(project.session_id, false);
                        SyncReport {
                            node: node.name.clone(),
                            result: Err(FarmError::sync(&node.name, format!("no network path set for {os:?}"))),
                        }
                    }
                }
            }
        }))
        .await
    }

    /// Read the file for sending. Fails when its content is no longer `version`.
    async fn load(&self, path: &Path, version: &str, compressed: bool) -> Result<Vec<u8>, FarmError> {
        let data = tokio::fs::read(path).await?;
        let expected = version.to_owned();
        tokio::task::spawn_blocking(move || {
            let actual = content_version(&data);
            if actual != expected {
                return Err(FarmError::InvalidState(format!(
                    "file changed since version {expected} (now {actual})"
                )));
            }
            if compressed {
                Ok(compress(&data)?)
            } else {
                Ok(data)
            }
        })
        .await
        .map_err(|e| FarmError::Io(std::io::Error::other(e)))?
    }

    async fn sync_node(&self, project: &ProjectFile, node: &RenderNode, payload: SyncPayload) -> SyncReport {
        let result = if !node.is_connected() {
            Err(FarmError::sync(&node.name, "node is not connected"))
        } else {
            node.sync(payload).await.map_err(|e| match e {
                FarmError::Sync { .. } => e,
                other => FarmError::sync(&node.name, other),
            })
        };

        match &result {
            Ok(()) => tracing::info!("Node {} synced {}", node.name, project.file_name()),
            Err(e) => tracing::warn!("{e}"),
        }
        node.mark_synced(project.session_id, result.is_ok());
        SyncReport {
            node: node.name.clone(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project_file::{NetworkPaths, ProjectOptions};
    use crate::test_util::{connected_node, MockNodeClient};

    fn blend_file(dir: &Path, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join("scene.blend");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn content_version_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = blend_file(dir.path(), b"first");
        let a = compute_file_version(&path, false).await.unwrap();
        assert!(a.starts_with("b3:"));
        assert_eq!(a, compute_file_version(&path, false).await.unwrap());

        std::fs::write(&path, b"second").unwrap();
        assert_ne!(a, compute_file_version(&path, false).await.unwrap());
    }

    #[tokio::test]
    async fn changed_version_resets_sync_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = blend_file(dir.path(), b"first");
        let mut project = ProjectFile::new(&path, ProjectOptions::default());
        let (node, _) = connected_node("a", MockNodeClient::default()).await;
        let nodes = vec![node.clone()];
        let sync = FileSynchronizer;

        let (_, changed) = sync.update_file_version(&mut project, &nodes).await.unwrap();
        assert!(changed);
        node.mark_synced(project.session_id, true);

        let (_, changed) = sync.update_file_version(&mut project, &nodes).await.unwrap();
        assert!(!changed);
        assert!(node.is_session_synced(&project.session_id));

        std::fs::write(&path, b"second").unwrap();
        let (_, changed) = sync.update_file_version(&mut project, &nodes).await.unwrap();
        assert!(changed);
        assert!(!node.is_session_synced(&project.session_id));
    }

    #[tokio::test]
    async fn one_failing_node_does_not_block_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = blend_file(dir.path(), b"scene data");
        let mut project = ProjectFile::new(&path, ProjectOptions::default());
        let (good, _) = connected_node("good", MockNodeClient::default()).await;
        let (bad, _) = connected_node("bad", MockNodeClient::default().fail_sync()).await;
        let nodes = vec![good.clone(), bad.clone()];
        let sync = FileSynchronizer;

        let (version, _) = sync.update_file_version(&mut project, &nodes).await.unwrap();
        let reports = sync.sync(&project, &version, &nodes).await;

        assert_eq!(reports.len(), 2);
        assert!(good.is_session_synced(&project.session_id));
        assert!(!bad.is_session_synced(&project.session_id));
        let failed = reports.iter().find(|r| r.node == "bad").unwrap();
        assert!(matches!(failed.result, Err(FarmError::Sync { .. })));
    }

    #[tokio::test]
    async fn compressed_payload_unpacks_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"BLENDER-v400".repeat(100);
        let path = blend_file(dir.path(), &content);
        let options = ProjectOptions {
            use_sync_compression: true,
            ..Default::default()
        };
        let project = ProjectFile::new(&path, options);
        let (node, client) = connected_node("a", MockNodeClient::default()).await;

        sync_once(&project, &[node]).await;
        let payloads = client.calls().synced;
        match &payloads[0].source {
            SyncSource::Bytes { data, compressed: true } => assert_eq!(decompress(data).unwrap(), content),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[tokio::test]
    async fn network_mode_sends_path_for_node_os() {
        let dir = tempfile::tempdir().unwrap();
        let path = blend_file(dir.path(), b"scene data");
        let options = ProjectOptions {
            use_networked_path: true,
            network_paths: NetworkPaths {
                windows: Some(r"\\nas\scene.blend".to_owned()),
                linux: Some("/mnt/nas/scene.blend".to_owned()),
                macos: Some("/Volumes/nas/scene.blend".to_owned()),
            },
            ..Default::default()
        };
        let project = ProjectFile::new(&path, options);
        let client = MockNodeClient::default().with_os(crate::models::computer_spec::NodeOs::Windows);
        let (node, client) = connected_node("win", client).await;

        sync_once(&project, &[node]).await;
        assert_eq!(
            client.calls().synced[0].source,
            SyncSource::NetworkPath(r"\\nas\scene.blend".to_owned())
        );
    }

    #[tokio::test]
    async fn synced_nodes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = blend_file(dir.path(), b"scene data");
        let project = ProjectFile::new(&path, ProjectOptions::default());
        let (node, client) = connected_node("a", MockNodeClient::default()).await;

        sync_once(&project, &[node.clone()]).await;
        sync_once(&project, &[node]).await;
        assert_eq!(client.calls().sync, 1);
    }

    #[tokio::test]
    async fn edit_after_versioning_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let path = blend_file(dir.path(), b"BLENDER-v400 scene");
        let project = ProjectFile::new(&path, ProjectOptions::default());
        let (node, client) = connected_node("a", MockNodeClient::default()).await;
        let version = compute_file_version(&path, false).await.unwrap();

        std::fs::write(&path, b"BLENDER-v400 edited").unwrap();
        let reports = FileSynchronizer.sync(&project, &version, &[node.clone()]).await;

        assert!(matches!(reports[0].result, Err(FarmError::Sync { .. })));
        assert!(!node.is_session_synced(&project.session_id));
        assert_eq!(client.calls().sync, 0);
    }

    async fn sync_once(project: &ProjectFile, nodes: &[Arc<RenderNode>]) {
        let version = compute_file_version(&project.blend_file, project.options.use_networked_path)
            .await
            .unwrap();
        let reports = FileSynchronizer.sync(project, &version, nodes).await;
        assert!(reports.iter().all(SyncReport::is_ok));
    }
}
