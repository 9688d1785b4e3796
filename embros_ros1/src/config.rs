//! Node configuration: the local name, the advertised XMLRPC and TCPROS
//! endpoints, and the Master location.
//!
//! A configuration can be persisted with [`NodeConfig::save_to`] /
//! [`NodeConfig::load_from`]. The file layout is a plain field dump in a
//! fixed order with native-endian lengths; it is private to a build and not
//! portable across architectures.

use crate::names::{split_http_uri, Name};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use embros_common::Error;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Fully-qualified node name, e.g. `/turtlesim`.
    pub node_name: Name,
    /// Local bind address for the Slave XMLRPC listener.
    pub xmlrpc_addr: SocketAddr,
    /// Advertised XMLRPC URI, `http://host:port/`.
    pub xmlrpc_uri: String,
    /// Local bind address for the TCPROS listener.
    pub tcpros_addr: SocketAddr,
    /// Advertised TCPROS URI, `rosrpc://host:port`.
    pub tcpros_uri: String,
    /// The Master's XMLRPC URI, `http://host:port`.
    pub master_uri: String,
    /// Host name advertised to peers; defaults to the machine hostname.
    pub hostname: String,
    /// Emit the legacy fixed-width `Content-Length` framing on every XMLRPC
    /// message, for masters that check the header before parsing.
    pub fixed_content_length: bool,
}

impl NodeConfig {
    /// Builds a configuration with ephemeral listener ports and advertised
    /// URIs derived from the local hostname. `node_name` may be relative; it
    /// is made global.
    pub fn new(master_uri: &str, node_name: &str) -> Result<Self, Error> {
        split_http_uri(master_uri)?;
        let global;
        let name_text = if node_name.starts_with('/') {
            node_name
        } else {
            global = format!("/{}", node_name);
            &global
        };
        let node_name = Name::new(name_text)?;
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Ok(Self {
            node_name,
            xmlrpc_addr: any,
            xmlrpc_uri: String::new(),
            tcpros_addr: any,
            tcpros_uri: String::new(),
            master_uri: master_uri.trim_end_matches('/').to_owned(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            fixed_content_length: false,
        })
    }

    /// Fills the advertised URIs once the listeners are bound.
    pub fn set_advertised_ports(&mut self, xmlrpc_port: u16, tcpros_port: u16) {
        self.xmlrpc_uri = format!("http://{}:{}/", self.hostname, xmlrpc_port);
        self.tcpros_uri = format!("rosrpc://{}:{}", self.hostname, tcpros_port);
    }

    /// The Master location as `(host, port)`.
    pub fn master_addr(&self) -> (String, u16) {
        split_http_uri(&self.master_uri).expect("master URI was validated at construction")
    }

    /// Writes the configuration to `path` in the private binary layout.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        write_string(&mut file, self.node_name.as_str())?;
        write_addr(&mut file, &self.xmlrpc_addr)?;
        write_string(&mut file, &self.xmlrpc_uri)?;
        write_addr(&mut file, &self.tcpros_addr)?;
        write_string(&mut file, &self.tcpros_uri)?;
        let (master_host, master_port) = self.master_addr();
        let master_ip = master_host.parse::<Ipv4Addr>().unwrap_or(Ipv4Addr::UNSPECIFIED);
        write_addr(
            &mut file,
            &SocketAddr::V4(SocketAddrV4::new(master_ip, master_port)),
        )?;
        write_string(&mut file, &self.master_uri)?;
        file.flush()
    }

    /// Reads a configuration previously written by [`NodeConfig::save_to`].
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let mut file = std::fs::File::open(path)?;
        let node_name = Name::new(&read_string(&mut file)?)?;
        let xmlrpc_addr = read_addr(&mut file)?;
        let xmlrpc_uri = read_string(&mut file)?;
        let tcpros_addr = read_addr(&mut file)?;
        let tcpros_uri = read_string(&mut file)?;
        let _master_addr = read_addr(&mut file)?;
        let master_uri = read_string(&mut file)?;
        split_http_uri(&master_uri)?;
        Ok(Self {
            node_name,
            xmlrpc_addr,
            xmlrpc_uri,
            tcpros_addr,
            tcpros_uri,
            master_uri,
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            fixed_content_length: false,
        })
    }
}

fn write_string<W: Write>(out: &mut W, text: &str) -> std::io::Result<()> {
    out.write_u64::<NativeEndian>(text.len() as u64)?;
    out.write_all(text.as_bytes())
}

fn read_string<R: Read>(input: &mut R) -> std::io::Result<String> {
    let length = input.read_u64::<NativeEndian>()? as usize;
    let mut bytes = vec![0u8; length];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 string"))
}

fn write_addr<W: Write>(out: &mut W, addr: &SocketAddr) -> std::io::Result<()> {
    let ip = match addr {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "only IPv4 addresses are persisted",
            ))
        }
    };
    out.write_all(&ip.octets())?;
    out.write_u16::<NativeEndian>(addr.port())
}

fn read_addr<R: Read>(input: &mut R) -> std::io::Result<SocketAddr> {
    let mut octets = [0u8; 4];
    input.read_exact(&mut octets)?;
    let port = input.read_u16::<NativeEndian>()?;
    Ok(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(octets),
        port,
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_names_are_made_global() {
        let config = NodeConfig::new("http://localhost:11311", "talker").unwrap();
        assert_eq!(config.node_name.as_str(), "/talker");
    }

    #[test]
    fn rejects_a_malformed_master_uri() {
        assert!(NodeConfig::new("localhost:11311", "/x").is_err());
    }

    #[test]
    fn save_load_round_trips() {
        let mut config = NodeConfig::new("http://127.0.0.1:11311", "/roundtrip").unwrap();
        config.xmlrpc_addr = "127.0.0.1:39001".parse().unwrap();
        config.tcpros_addr = "127.0.0.1:39002".parse().unwrap();
        config.xmlrpc_uri = "http://box:39001/".to_owned();
        config.tcpros_uri = "rosrpc://box:39002".to_owned();

        let path = std::env::temp_dir().join(format!("embros-config-{}", std::process::id()));
        config.save_to(&path).unwrap();
        let loaded = NodeConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.node_name.as_str(), "/roundtrip");
        assert_eq!(loaded.xmlrpc_addr, config.xmlrpc_addr);
        assert_eq!(loaded.xmlrpc_uri, config.xmlrpc_uri);
        assert_eq!(loaded.tcpros_uri, config.tcpros_uri);
        assert_eq!(loaded.master_uri, "http://127.0.0.1:11311");
    }
}
