//! Artifact names derived from cache keys

use crate::config::TableNaming;

/// Sidecar file extension
pub const SIDECAR_EXTENSION: &str = ".json";

impl TableNaming {
    /// Family of a namespaced key (`"qc/123"` -> `Some("qc")`)
    pub fn family<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.split_once('/').map(|(family, _)| family)
    }

    /// Whether all members of this key's family share one sidecar
    pub fn is_grouped(&self, key: &str) -> bool {
        self.family(key)
            .map(|family| self.grouped_namespaces.iter().any(|g| g == family))
            .unwrap_or(false)
    }

    /// Object name of a table, relative to the store root
    pub fn table_file(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, key, self.extension)
    }

    /// Base name of the sidecar, without extension
    ///
    /// Grouped families collapse to one sidecar for the whole family.
    pub fn sidecar_stem(&self, key: &str) -> String {
        match self.family(key) {
            Some(family) if self.is_grouped(key) => format!("{}{}", self.prefix, family),
            _ => format!("{}{}", self.prefix, key),
        }
    }

    /// Object name of the sidecar, relative to the store root
    pub fn sidecar_file(&self, key: &str) -> String {
        format!("{}{}", self.sidecar_stem(key), SIDECAR_EXTENSION)
    }

    /// Warehouse table identifier
    ///
    /// Distinct keys always map to distinct identifiers, including on
    /// warehouses that fold identifier case.
    pub fn table_ident(&self, key: &str) -> String {
        format!("{}{}", self.prefix, escape_ident(key))
    }

    /// Warehouse identifier of the sidecar table
    ///
    /// Grouped families share the sidecar of the bare `<family>/` key.
    pub fn sidecar_ident(&self, key: &str) -> String {
        let owner = match self.family(key) {
            Some(family) if self.is_grouped(key) => format!("{}/", family),
            _ => key.to_string(),
        };
        format!("{}{}{}", self.prefix, escape_ident(&owner), SIDECAR_TABLE_SUFFIX)
    }
}

/// Suffix of sidecar tables; `_c` never occurs in an escaped key
pub const SIDECAR_TABLE_SUFFIX: &str = "_columns";

/// Escape a key into `[a-z0-9_]`
///
/// Lowercase letters and digits pass through. Everything else becomes an
/// `_`-led code: `__` for `_`, `_s_` for `/`, `_u<c>` for an uppercase
/// letter and `_x<hex>_` for any other character. No code is a prefix of
/// another, so the mapping is reversible.
pub fn escape_ident(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            '_' => out.push_str("__"),
            '/' => out.push_str("_s_"),
            'A'..='Z' => {
                out.push_str("_u");
                out.push(c.to_ascii_lowercase());
            }
            other => out.push_str(&format!("_x{:x}_", other as u32)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_file() {
        let naming = TableNaming::default();
        assert_eq!(naming.table_file("unique_project_names"), "zs_unique_project_names.pqt");
        assert_eq!(naming.table_file("qc/614173"), "zs_qc/614173.pqt");
    }

    #[test]
    fn test_sidecar_collapses_for_grouped_family() {
        let naming = TableNaming::default();
        assert_eq!(naming.sidecar_file("asset_basics"), "zs_asset_basics.json");
        assert_eq!(naming.sidecar_file("qc/614173"), "zs_qc.json");
        assert_eq!(naming.sidecar_file("qc/000001"), "zs_qc.json");
        assert_eq!(naming.sidecar_file("other/1"), "zs_other/1.json");
    }

    #[test]
    fn test_families_do_not_collide() {
        let naming = TableNaming::default();
        assert_ne!(naming.table_file("qc/a"), naming.table_file("qca"));
        assert_ne!(naming.sidecar_file("qc/a"), naming.sidecar_file("asset_basics"));
    }

    #[test]
    fn test_warehouse_idents() {
        let naming = TableNaming::default();
        assert_eq!(naming.table_ident("qc/614173"), "zs_qc_s_614173");
        assert_eq!(naming.table_ident("qc/Mouse-1"), "zs_qc_s__umouse_x2d_1");
        assert_eq!(naming.table_ident("asset_basics"), "zs_asset__basics");
        assert_eq!(naming.sidecar_ident("qc/Mouse-1"), "zs_qc_s__columns");
        assert_eq!(naming.sidecar_ident("asset_basics"), "zs_asset__basics_columns");
    }

    #[test]
    fn test_warehouse_idents_are_distinct() {
        let naming = TableNaming::default();
        let keys = [
            "qc/a",
            "qc_a",
            "qca",
            "qc/Mouse",
            "qc/mouse",
            "qc/mouse-1",
            "qc/mouse_1",
            "qc/mouse.1",
            "asset_basics",
            "asset_basics_columns",
            "asset_basics/",
            "qc/",
            "qc",
        ];

        let mut idents: Vec<String> = keys.iter().map(|k| naming.table_ident(k)).collect();
        idents.push(naming.sidecar_ident("asset_basics"));
        idents.push(naming.sidecar_ident("qc"));
        idents.push(naming.sidecar_ident("qc/a"));

        let unique: std::collections::HashSet<&String> = idents.iter().collect();
        assert_eq!(unique.len(), idents.len(), "{:?}", idents);
        assert!(idents
            .iter()
            .all(|i| i.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')));
    }
}
