//! Este modulo implementa PathInfo: el descriptor inmutable de un
//! path (funcion de consenso, lider, replicas, version).
use crate::service_address::ServiceAddress;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    path_name: String,
    consensus_fn_name: String,
    version: u32,
    root_leader: ServiceAddress,
    root_servers: Vec<ServiceAddress>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PathInfoError {
    VersionMustBePositive,
    LeaderNotInReplicas,
}

impl PathInfo {
    pub fn new(
        path_name: String,
        consensus_fn_name: String,
        version: u32,
        root_leader: ServiceAddress,
        root_servers: Vec<ServiceAddress>,
    ) -> Result<Self, PathInfoError> {
        if version < 1 {
            return Err(PathInfoError::VersionMustBePositive);
        }
        if !root_servers.contains(&root_leader) {
            return Err(PathInfoError::LeaderNotInReplicas);
        }
        Ok(Self {
            path_name,
            consensus_fn_name,
            version,
            root_leader,
            root_servers,
        })
    }

    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    pub fn consensus_fn_name(&self) -> &str {
        &self.consensus_fn_name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn root_leader(&self) -> ServiceAddress {
        self.root_leader
    }

    pub fn root_servers(&self) -> &[ServiceAddress] {
        &self.root_servers
    }

    pub fn is_leader(&self, addr: ServiceAddress) -> bool {
        self.root_leader == addr
    }

    /// Crea una nueva version de este PathInfo con membresia
    /// actualizada, incrementando el numero de version.
    pub fn with_new_membership(
        &self,
        root_leader: ServiceAddress,
        root_servers: Vec<ServiceAddress>,
    ) -> Result<Self, PathInfoError> {
        Self::new(
            self.path_name.clone(),
            self.consensus_fn_name.clone(),
            self.version + 1,
            root_leader,
            root_servers,
        )
    }

    /// Serializacion canonica: `fn,ver,[*leader|replica]{,...}`.
    pub fn to_canonical_string(&self) -> String {
        let mut parts = vec![self.consensus_fn_name.clone(), self.version.to_string()];
        for server in &self.root_servers {
            let marker = if *server == self.root_leader { "*" } else { "" };
            parts.push(format!("{marker}{server}"));
        }
        parts.join(",")
    }
}

impl fmt::Display for PathInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ServiceAddress {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test01_new_rejects_version_zero() {
        let leader = addr(1);
        let err = PathInfo::new("p".into(), "echo".into(), 0, leader, vec![leader]).unwrap_err();
        assert_eq!(err, PathInfoError::VersionMustBePositive);
    }

    #[test]
    fn test02_new_rejects_leader_not_in_replicas() {
        let leader = addr(1);
        let other = addr(2);
        let err = PathInfo::new("p".into(), "echo".into(), 1, leader, vec![other]).unwrap_err();
        assert_eq!(err, PathInfoError::LeaderNotInReplicas);
    }

    #[test]
    fn test03_canonical_string_marks_leader() {
        let leader = addr(1);
        let replica = addr(2);
        let info = PathInfo::new(
            "p".into(),
            "echo".into(),
            2,
            leader,
            vec![leader, replica],
        )
        .unwrap();
        let s = info.to_canonical_string();
        assert!(s.starts_with("echo,2,"));
        assert!(s.contains(&format!("*{leader}")));
        assert!(s.contains(&replica.to_string()));
    }

    #[test]
    fn test04_with_new_membership_bumps_version() {
        let leader = addr(1);
        let info = PathInfo::new("p".into(), "echo".into(), 1, leader, vec![leader]).unwrap();
        let replica = addr(2);
        let updated = info
            .with_new_membership(leader, vec![leader, replica])
            .unwrap();
        assert_eq!(updated.version(), 2);
        assert_eq!(updated.root_servers().len(), 2);
    }
}
