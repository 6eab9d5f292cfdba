//! Config: carga de un archivo .conf de pares clave=valor, siguiendo el
//! mismo esquema de parseo que el nodo Redis del que parte este repo,
//! generalizado a las claves de manager/root/block/cliente.
use addressing::ServiceAddress;
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone)]
pub struct Config {
    bind_address: ServiceAddress,
    manager_unique_id_hint: Option<u8>,
    cluster_peers: Vec<ServiceAddress>,
    node_timeout_ms: u64,
    data_dir: String,
    log_file: String,
    manager_seed_addrs: Vec<ServiceAddress>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let lines = Self::read_lines_from_file(path)?;
        let map = Self::parse_key_value_lines(lines, '=', "config")?;

        Ok(Config {
            bind_address: Self::get_address(&map, "bind_address")?,
            manager_unique_id_hint: Self::get_optional_u8(&map, "manager_unique_id_hint")?,
            cluster_peers: Self::get_address_list(&map, "cluster_peers"),
            node_timeout_ms: Self::get_u64(&map, "node_timeout_ms")?,
            data_dir: Self::get(&map, "data_dir")?,
            log_file: Self::get(&map, "log_file")?,
            manager_seed_addrs: Self::get_address_list(&map, "manager_seed_addrs"),
        })
    }

    pub fn bind_address(&self) -> ServiceAddress {
        self.bind_address
    }

    pub fn manager_unique_id_hint(&self) -> Option<u8> {
        self.manager_unique_id_hint
    }

    pub fn cluster_peers(&self) -> &[ServiceAddress] {
        &self.cluster_peers
    }

    pub fn node_timeout_ms(&self) -> u64 {
        self.node_timeout_ms
    }

    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    pub fn manager_seed_addrs(&self) -> &[ServiceAddress] {
        &self.manager_seed_addrs
    }

    // funciones privadas para el manejo de la configuracion

    fn read_lines_from_file(path: &str) -> Result<Vec<String>, String> {
        let contents = fs::read_to_string(path).map_err(|e| format!("error leyendo archivo de configuracion '{path}': {e}"))?;
        let lines = contents
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
            .map(|line| line.to_string())
            .collect();
        Ok(lines)
    }

    fn parse_key_value_lines(lines: Vec<String>, delimiter: char, context: &str) -> Result<HashMap<String, String>, String> {
        let mut map = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(delimiter) {
                map.insert(key.trim().to_string(), value.trim().to_string());
            } else {
                return Err(format!("linea mal formada en '{context}': {line}"));
            }
        }
        Ok(map)
    }

    fn get(map: &HashMap<String, String>, key: &str) -> Result<String, String> {
        map.get(key).cloned().ok_or_else(|| format!("falta el campo obligatorio en el config: '{key}'"))
    }

    fn get_u64(map: &HashMap<String, String>, key: &str) -> Result<u64, String> {
        let value_str = Self::get(map, key)?;
        value_str.parse::<u64>().map_err(|_| format!("no se pudo parsear '{key}' (\"{value_str}\") como u64"))
    }

    fn get_optional_u8(map: &HashMap<String, String>, key: &str) -> Result<Option<u8>, String> {
        match map.get(key) {
            None => Ok(None),
            Some(value) if value.is_empty() => Ok(None),
            Some(value) => value.parse::<u8>().map(Some).map_err(|_| format!("no se pudo parsear '{key}' (\"{value}\") como u8")),
        }
    }

    fn get_address(map: &HashMap<String, String>, key: &str) -> Result<ServiceAddress, String> {
        let value = Self::get(map, key)?;
        value.parse::<ServiceAddress>().map_err(|_| format!("el valor de '{key}' (\"{value}\") no es una direccion valida"))
    }

    fn get_address_list(map: &HashMap<String, String>, key: &str) -> Vec<ServiceAddress> {
        match map.get(key) {
            None => Vec::new(),
            Some(value) if value.is_empty() => Vec::new(),
            Some(value) => value.split(',').filter_map(|entry| entry.trim().parse::<ServiceAddress>().ok()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_conf(contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("treemesh_config_test_{:?}.conf", std::thread::current().id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test01_parses_manager_config_with_cluster_peers() {
        let path = write_temp_conf(
            "bind_address = 127.0.0.1:9500\n\
             manager_unique_id_hint = 3\n\
             cluster_peers = 127.0.0.1:9501,127.0.0.1:9502\n\
             node_timeout_ms = 15000\n\
             data_dir = ./data\n\
             log_file = ./treemesh.log\n",
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.bind_address().port(), 9500);
        assert_eq!(config.manager_unique_id_hint(), Some(3));
        assert_eq!(config.cluster_peers().len(), 2);
        assert_eq!(config.node_timeout_ms(), 15000);
        assert_eq!(config.data_dir(), "./data");
        fs::remove_file(path).ok();
    }

    #[test]
    fn test02_missing_required_field_is_an_error() {
        let path = write_temp_conf("node_timeout_ms = 15000\n");
        assert!(Config::from_file(&path).is_err());
        fs::remove_file(path).ok();
    }

    #[test]
    fn test03_blank_unique_id_hint_and_peers_default_to_empty() {
        let path = write_temp_conf(
            "bind_address = 127.0.0.1:9600\n\
             manager_unique_id_hint =\n\
             node_timeout_ms = 15000\n\
             data_dir = ./data\n\
             log_file = ./treemesh.log\n",
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.manager_unique_id_hint(), None);
        assert!(config.cluster_peers().is_empty());
        assert!(config.manager_seed_addrs().is_empty());
        fs::remove_file(path).ok();
    }

    #[test]
    fn test04_comments_and_blank_lines_are_ignored() {
        let path = write_temp_conf(
            "# this is a comment\n\
             \n\
             bind_address = 127.0.0.1:9700\n\
             node_timeout_ms = 5000\n\
             data_dir = ./data\n\
             log_file = ./treemesh.log\n",
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.bind_address().port(), 9700);
        fs::remove_file(path).ok();
    }
}
