use std::path::{Path, PathBuf};

/// Resolved locations of the CSV extracts. `None` means the table is not available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSources {
    pub accounts: Option<PathBuf>,
    pub products: Option<PathBuf>,
    pub sectors: Option<PathBuf>,
    pub gl_categories: Option<PathBuf>,
    pub snapshots: Option<PathBuf>,
    pub revenue: Option<PathBuf>,
}

/// File-name fragments used to find each extract in the data directory.
pub const ACCOUNTS_PATTERN: &str = "accounts_data";
pub const PRODUCTS_PATTERN: &str = "product type lookup";
pub const SECTORS_PATTERN: &str = "rbz sector classification";
pub const GL_CATEGORIES_PATTERN: &str = "gl category lookup";
pub const SNAPSHOTS_PATTERN: &str = "customer_snapshot";
pub const REVENUE_PATTERN: &str = "gl_revenue";

/// Explicit paths given on the command line; each one wins over discovery.
#[derive(Debug, Clone, Default)]
pub struct SourceOverrides {
    pub accounts: Option<PathBuf>,
    pub products: Option<PathBuf>,
    pub sectors: Option<PathBuf>,
    pub gl_categories: Option<PathBuf>,
    pub snapshots: Option<PathBuf>,
    pub revenue: Option<PathBuf>,
}

impl DataSources {
    pub fn discover(data_dir: &Path, overrides: SourceOverrides) -> anyhow::Result<Self> {
        let files = csv_files(data_dir)?;
        let find = |pattern: &str| find_csv(&files, pattern);

        let sources = Self {
            accounts: overrides.accounts.or_else(|| find(ACCOUNTS_PATTERN)),
            products: overrides.products.or_else(|| find(PRODUCTS_PATTERN)),
            sectors: overrides.sectors.or_else(|| find(SECTORS_PATTERN)),
            gl_categories: overrides.gl_categories.or_else(|| find(GL_CATEGORIES_PATTERN)),
            snapshots: overrides.snapshots.or_else(|| find(SNAPSHOTS_PATTERN)),
            revenue: overrides.revenue.or_else(|| find(REVENUE_PATTERN)),
        };
        log::debug!("resolved data sources: {sources:?}");
        Ok(sources)
    }
}

fn csv_files(data_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !data_dir.is_dir() {
        log::warn!("data directory {} does not exist", data_dir.display());
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// First file whose lowercased name contains `pattern`. Data dictionaries
/// (column descriptions, not rows) never match.
fn find_csv(files: &[PathBuf], pattern: &str) -> Option<PathBuf> {
    files
        .iter()
        .find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(str::to_lowercase)
                .is_some_and(|n| n.contains(pattern) && !n.contains("dictionary"))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from("data").join(n)).collect()
    }

    #[test]
    fn finds_files_by_fragment_case_insensitively() {
        let files = paths(&[
            "NMB accounts_datadictionary.csv",
            "NMB accounts_data_2025.csv",
            "PRODUCT TYPE LOOKUP.csv",
        ]);
        assert_eq!(
            find_csv(&files, ACCOUNTS_PATTERN),
            Some(PathBuf::from("data/NMB accounts_data_2025.csv"))
        );
        assert_eq!(
            find_csv(&files, PRODUCTS_PATTERN),
            Some(PathBuf::from("data/PRODUCT TYPE LOOKUP.csv"))
        );
        assert_eq!(find_csv(&files, REVENUE_PATTERN), None);
    }

    #[test]
    fn missing_directory_discovers_nothing() {
        let overrides = SourceOverrides {
            accounts: Some(PathBuf::from("extract.csv")),
            ..SourceOverrides::default()
        };
        let sources =
            DataSources::discover(Path::new("/nonexistent/kpi-data"), overrides).unwrap();
        assert_eq!(sources.accounts, Some(PathBuf::from("extract.csv")));
        assert_eq!(sources.products, None);
    }

    #[test]
    fn lookup_overrides_win_over_discovery() {
        let dir = std::env::temp_dir().join(format!("kpi-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let discovered = dir.join("RBZ Sector Classification.csv");
        std::fs::write(&discovered, "Sector Code\n01\n").unwrap();
        std::fs::write(dir.join("GL Category Lookup.csv"), "Gl Code\n4001\n").unwrap();

        let overrides = SourceOverrides {
            gl_categories: Some(PathBuf::from("custom gl.csv")),
            ..SourceOverrides::default()
        };
        let sources = DataSources::discover(&dir, overrides).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(sources.sectors, Some(discovered));
        assert_eq!(sources.gl_categories, Some(PathBuf::from("custom gl.csv")));
    }
}
