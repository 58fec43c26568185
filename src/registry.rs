//! JSON-backed address book of client nodes, shared through a file that
//! every role reads at startup and clients rewrite when joining or leaving.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::message::{NodeId, NodePtr};
use crate::utils::DsmError;

/// Node registry file handle.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    /// Path to the JSON file, mapping node ID -> address.
    path: PathBuf,
}

impl NodeRegistry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        NodeRegistry {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Reads the current registry. A missing file means no node has
    /// registered yet.
    pub fn load(&self) -> Result<BTreeMap<NodeId, SocketAddr>, DsmError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(
        &self,
        nodes: &BTreeMap<NodeId, SocketAddr>,
    ) -> Result<(), DsmError> {
        fs::write(&self.path, serde_json::to_string(nodes)?)?;
        Ok(())
    }

    /// Registers a new client on `ip`. It takes the first vacant node ID and
    /// listens on port `base_port + id`.
    pub fn join(
        &self,
        ip: IpAddr,
        base_port: u16,
    ) -> Result<NodePtr, DsmError> {
        let mut nodes = self.load()?;
        let id = (0..).find(|id| !nodes.contains_key(id)).unwrap_or(0);
        let port = u16::try_from(id)
            .ok()
            .and_then(|offset| base_port.checked_add(offset))
            .ok_or_else(|| {
                DsmError::msg(format!("no port left for node {}", id))
            })?;

        let node = NodePtr::new(id, SocketAddr::new(ip, port));
        nodes.insert(id, node.addr);
        self.store(&nodes)?;
        Ok(node)
    }

    /// Removes a client from the registry.
    pub fn leave(&self, id: NodeId) -> Result<(), DsmError> {
        let mut nodes = self.load()?;
        if nodes.remove(&id).is_none() {
            return Err(DsmError::msg(format!(
                "node {} not found in '{}'",
                id,
                self.path.display()
            )));
        }
        self.store(&nodes)
    }

    /// Path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All registered clients.
    pub fn clients(&self) -> Result<Vec<NodePtr>, DsmError> {
        Ok(self
            .load()?
            .into_iter()
            .map(|(id, addr)| NodePtr::new(id, addr))
            .collect())
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use std::env;

    fn scratch_registry(name: &str) -> NodeRegistry {
        let path = env::temp_dir().join(format!("ivydsm-{}.json", name));
        let _ = fs::remove_file(&path);
        NodeRegistry::new(path)
    }

    #[test]
    fn missing_file_is_empty() -> Result<(), DsmError> {
        let registry = scratch_registry("missing");
        assert!(registry.load()?.is_empty());
        assert!(registry.clients()?.is_empty());
        Ok(())
    }

    #[test]
    fn join_assigns_ids_and_ports() -> Result<(), DsmError> {
        let registry = scratch_registry("join");
        let ip: IpAddr = "127.0.0.1".parse()?;
        let n0 = registry.join(ip, 8002)?;
        let n1 = registry.join(ip, 8002)?;
        assert_eq!(n0.id, 0);
        assert_eq!(n0.addr, "127.0.0.1:8002".parse::<SocketAddr>()?);
        assert_eq!(n1.id, 1);
        assert_eq!(n1.addr, "127.0.0.1:8003".parse::<SocketAddr>()?);
        assert_eq!(registry.clients()?.len(), 2);
        Ok(())
    }

    #[test]
    fn leave_frees_id() -> Result<(), DsmError> {
        let registry = scratch_registry("leave");
        let ip: IpAddr = "127.0.0.1".parse()?;
        for _ in 0..3 {
            registry.join(ip, 8002)?;
        }
        registry.leave(1)?;
        assert!(registry.leave(1).is_err());
        let again = registry.join(ip, 8002)?;
        assert_eq!(again.id, 1);
        assert_eq!(registry.load()?.len(), 3);
        Ok(())
    }

    #[test]
    fn file_is_id_to_address_json() -> Result<(), DsmError> {
        let registry = scratch_registry("format");
        fs::write(
            &registry.path,
            r#"{"0":"127.0.0.1:8002","4":"127.0.0.1:8006"}"#,
        )?;
        let nodes = registry.load()?;
        let addr: SocketAddr = "127.0.0.1:8006".parse()?;
        assert_eq!(nodes.get(&4), Some(&addr));
        Ok(())
    }
}
