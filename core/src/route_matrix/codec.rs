/// Binary wire format for the route matrix
///
/// Big-endian, length-prefixed strings. Fields added after version 1 are
/// appended at the end so older readers stay valid for older data.
use super::RouteMatrix;
use crate::error::{CoreError, Result};
use crate::matrix::tri_len;
use crate::optimizer::{Route, RouteEntry};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Version written by this build
pub const ROUTE_MATRIX_VERSION: u32 = 2;

/// Oldest version still readable
pub const ROUTE_MATRIX_VERSION_MIN: u32 = 1;

/// Version 2 appends the dest relay flags
const DEST_RELAYS_VERSION: u32 = 2;

const MAX_RELAYS: usize = 1 << 16;
const MAX_STRING_LENGTH: usize = 256;
const MAX_ROUTES_PER_ENTRY: usize = 64;
const MAX_RELAYS_PER_ROUTE: usize = 5;

/// Smallest encoded route entry: direct cost and route count
const MIN_ENTRY_BYTES: usize = 5;

fn check_version(version: u32) -> Result<()> {
    if (ROUTE_MATRIX_VERSION_MIN..=ROUTE_MATRIX_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(CoreError::Codec(format!(
            "invalid route matrix version: {}",
            version
        )))
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    if value.len() > MAX_STRING_LENGTH {
        return Err(CoreError::Codec(format!(
            "string too long ({} bytes): {}",
            value.len(),
            value
        )));
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn ensure(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CoreError::Codec(format!(
            "truncated route matrix reading {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_string(buf: &mut impl Buf, what: &str) -> Result<String> {
    ensure(&*buf, 2, what)?;
    let len = buf.get_u16() as usize;
    if len > MAX_STRING_LENGTH {
        return Err(CoreError::Codec(format!("{} too long: {} bytes", what, len)));
    }
    ensure(&*buf, len, what)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| CoreError::Codec(format!("{} is not valid UTF-8", what)))
}

impl RouteMatrix {
    /// Serialize to bytes (writes `self.version`)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_version(self.version)?;
        self.validate()?;

        let mut buf = BytesMut::with_capacity(64 + self.num_relays() * 64 + self.route_entries.len() * 16);

        buf.put_u32(self.version);
        buf.put_u64(self.created_at);
        buf.put_u32(self.num_relays() as u32);

        for i in 0..self.num_relays() {
            buf.put_u64(self.relay_ids[i]);
            put_string(&mut buf, &self.relay_addresses[i].to_string())?;
            put_string(&mut buf, &self.relay_names[i])?;
            buf.put_f32(self.relay_latitudes[i]);
            buf.put_f32(self.relay_longitudes[i]);
            buf.put_u64(self.relay_datacenter_ids[i]);
        }

        buf.put_u32(self.route_entries.len() as u32);
        for entry in &self.route_entries {
            if entry.routes.len() > MAX_ROUTES_PER_ENTRY {
                return Err(CoreError::Codec(format!(
                    "route entry holds {} routes",
                    entry.routes.len()
                )));
            }
            buf.put_i32(entry.direct_cost);
            buf.put_u8(entry.routes.len() as u8);
            for route in &entry.routes {
                if route.relays.len() > MAX_RELAYS_PER_ROUTE {
                    return Err(CoreError::Codec(format!(
                        "route holds {} relays",
                        route.relays.len()
                    )));
                }
                buf.put_i32(route.cost);
                buf.put_u8(route.relays.len() as u8);
                buf.put_u32(route.hash);
                for relay in &route.relays {
                    buf.put_u32(*relay);
                }
            }
        }

        if self.version >= DEST_RELAYS_VERSION {
            for dest in &self.dest_relays {
                buf.put_u8(u8::from(*dest));
            }
        }

        Ok(buf.to_vec())
    }

    /// Parse bytes written by any supported version
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        ensure(&buf, 16, "header")?;
        let version = buf.get_u32();
        check_version(version)?;
        let created_at = buf.get_u64();
        let num_relays = buf.get_u32() as usize;
        if num_relays > MAX_RELAYS {
            return Err(CoreError::Codec(format!("too many relays: {}", num_relays)));
        }

        let mut relay_ids = Vec::with_capacity(num_relays);
        let mut relay_addresses = Vec::with_capacity(num_relays);
        let mut relay_names = Vec::with_capacity(num_relays);
        let mut relay_latitudes = Vec::with_capacity(num_relays);
        let mut relay_longitudes = Vec::with_capacity(num_relays);
        let mut relay_datacenter_ids = Vec::with_capacity(num_relays);

        for _ in 0..num_relays {
            ensure(&buf, 8, "relay id")?;
            relay_ids.push(buf.get_u64());
            let address = get_string(&mut buf, "relay address")?;
            let address: SocketAddr = address
                .parse()
                .map_err(|_| CoreError::Codec(format!("invalid relay address: {}", address)))?;
            relay_addresses.push(address);
            relay_names.push(get_string(&mut buf, "relay name")?);
            ensure(&buf, 16, "relay location")?;
            relay_latitudes.push(buf.get_f32());
            relay_longitudes.push(buf.get_f32());
            relay_datacenter_ids.push(buf.get_u64());
        }

        ensure(&buf, 4, "entry count")?;
        let num_entries = buf.get_u32() as usize;
        if num_entries != tri_len(num_relays) {
            return Err(CoreError::Codec(format!(
                "expected {} route entries, found {}",
                tri_len(num_relays),
                num_entries
            )));
        }

        ensure(&buf, num_entries.saturating_mul(MIN_ENTRY_BYTES), "route entries")?;
        let mut route_entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            ensure(&buf, MIN_ENTRY_BYTES, "route entry")?;
            let direct_cost = buf.get_i32();
            let num_routes = buf.get_u8() as usize;
            if num_routes > MAX_ROUTES_PER_ENTRY {
                return Err(CoreError::Codec(format!("too many routes: {}", num_routes)));
            }
            let mut routes = Vec::with_capacity(num_routes);
            for _ in 0..num_routes {
                ensure(&buf, 9, "route")?;
                let cost = buf.get_i32();
                let num_route_relays = buf.get_u8() as usize;
                let hash = buf.get_u32();
                if num_route_relays > MAX_RELAYS_PER_ROUTE {
                    return Err(CoreError::Codec(format!(
                        "route has too many relays: {}",
                        num_route_relays
                    )));
                }
                ensure(&buf, num_route_relays * 4, "route relays")?;
                let mut relays = Vec::with_capacity(num_route_relays);
                for _ in 0..num_route_relays {
                    let relay = buf.get_u32();
                    if relay as usize >= num_relays {
                        return Err(CoreError::Codec(format!(
                            "route relay index {} out of range",
                            relay
                        )));
                    }
                    relays.push(relay);
                }
                routes.push(Route { cost, hash, relays });
            }
            route_entries.push(RouteEntry {
                direct_cost,
                routes,
            });
        }

        let dest_relays = if version >= DEST_RELAYS_VERSION {
            ensure(&buf, num_relays, "dest relays")?;
            (0..num_relays).map(|_| buf.get_u8() != 0).collect()
        } else {
            vec![true; num_relays]
        };

        if buf.has_remaining() {
            return Err(CoreError::Codec(format!(
                "{} trailing bytes after route matrix",
                buf.remaining()
            )));
        }

        let mut matrix = RouteMatrix {
            version,
            created_at,
            relay_ids,
            relay_addresses,
            relay_names,
            relay_latitudes,
            relay_longitudes,
            relay_datacenter_ids,
            dest_relays,
            route_entries,
            relay_id_to_index: HashMap::new(),
        };
        matrix.rebuild_index();
        Ok(matrix)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let data = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write then rename so readers never see a partial matrix
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{tri_index, UNROUTABLE};
    use crate::optimizer::{optimize, OptimizeOptions};
    use crate::stats::RelayInfo;

    fn sample_matrix() -> RouteMatrix {
        let relays: Vec<RelayInfo> = ["la", "chicago", "denver"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut info =
                    RelayInfo::new(name, format!("10.0.0.{}:40000", i + 1).parse().unwrap(), i as u64 + 1);
                info.latitude = 30.0 + i as f32;
                info.longitude = -100.0 - i as f32;
                info.dest = i != 1;
                info
            })
            .collect();
        let mut costs = vec![UNROUTABLE; tri_len(3)];
        costs[tri_index(0, 1)] = 100;
        costs[tri_index(0, 2)] = 10;
        costs[tri_index(2, 1)] = 10;
        let entries = optimize(&costs, 3, 1, &OptimizeOptions::default());
        RouteMatrix::new(&relays, entries, 1_700_000_000)
    }

    #[test]
    fn test_round_trip() {
        let matrix = sample_matrix();
        let bytes = matrix.to_bytes().unwrap();
        let decoded = RouteMatrix::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, matrix);
        assert_eq!(decoded.dest_relays, vec![true, false, true]);
        assert_eq!(decoded.relay_index(matrix.relay_ids[2]), Some(2));
    }

    #[test]
    fn test_version_one_has_no_dest_relays() {
        let mut matrix = sample_matrix();
        matrix.version = 1;
        let bytes = matrix.to_bytes().unwrap();
        let decoded = RouteMatrix::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.dest_relays, vec![true; 3]);
        assert_eq!(decoded.route_entries, matrix.route_entries);
    }

    #[test]
    fn test_rejects_bad_input() {
        let matrix = sample_matrix();
        let bytes = matrix.to_bytes().unwrap();

        assert!(RouteMatrix::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(RouteMatrix::from_bytes(&trailing).is_err());

        let mut future = bytes.clone();
        future[..4].copy_from_slice(&99u32.to_be_bytes());
        assert!(RouteMatrix::from_bytes(&future).is_err());

        let mut unknown = matrix.clone();
        unknown.version = 0;
        assert!(unknown.to_bytes().is_err());
    }

    #[test]
    fn test_huge_entry_count_is_rejected_before_allocating() {
        let num_relays = 1usize << 16;
        let mut buf = BytesMut::new();
        buf.put_u32(ROUTE_MATRIX_VERSION);
        buf.put_u64(1);
        buf.put_u32(num_relays as u32);
        for i in 0..num_relays {
            buf.put_u64(i as u64);
            put_string(&mut buf, "1.1.1.1:1").unwrap();
            put_string(&mut buf, "").unwrap();
            buf.put_f32(0.0);
            buf.put_f32(0.0);
            buf.put_u64(0);
        }
        buf.put_u32(tri_len(num_relays) as u32);

        match RouteMatrix::from_bytes(&buf) {
            Err(CoreError::Codec(message)) => assert!(message.contains("route entries")),
            other => panic!("expected a truncation error, got {:?}", other.map(|m| m.num_relays())),
        }
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix").join("route_matrix.bin");
        let matrix = sample_matrix();
        matrix.write_file(&path).unwrap();
        assert_eq!(RouteMatrix::read_file(&path).unwrap(), matrix);
    }
}
