#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use hfs::{
    AttributeKey, BTree, BTreeKey, CatalogKey, ExtentKey, ExtentsTree, HeaderRecord, NodeUsage,
    open_tree_file,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::env;
use std::fmt::Display;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeKind {
    Catalog,
    Extents,
    Attributes,
}

impl TreeKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "catalog" => Ok(Self::Catalog),
            "extents" => Ok(Self::Extents),
            "attributes" => Ok(Self::Attributes),
            other => bail!("unknown tree kind {other:?} (expected catalog, extents or attributes)"),
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    header: HeaderRecord,
    node_usage: NodeUsage,
}

#[derive(Debug, Serialize)]
struct DumpEntry {
    key: String,
    payload_len: usize,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    leaf_records_declared: u32,
    leaf_records_walked: usize,
    leaf_records_visited: usize,
    keys_ascending: bool,
    node_usage: NodeUsage,
}

impl CheckReport {
    fn is_clean(&self) -> bool {
        usize::try_from(self.leaf_records_declared).ok() == Some(self.leaf_records_walked)
            && self.leaf_records_walked == self.leaf_records_visited
            && self.keys_ascending
            && self.node_usage.is_consistent()
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "dump" => {
            let Some(path) = args.next() else {
                bail!("dump requires <tree-file> <catalog|extents|attributes>");
            };
            let Some(kind) = args.next() else {
                bail!("dump requires <tree-file> <catalog|extents|attributes>");
            };
            let json = args.any(|arg| arg == "--json");
            let path = Path::new(&path);
            match TreeKind::parse(&kind)? {
                TreeKind::Catalog => dump::<CatalogKey>(path, json),
                TreeKind::Extents => dump::<ExtentKey>(path, json),
                TreeKind::Attributes => dump::<AttributeKey>(path, json),
            }
        }
        "check" => {
            let Some(path) = args.next() else {
                bail!("check requires <tree-file> <catalog|extents|attributes>");
            };
            let Some(kind) = args.next() else {
                bail!("check requires <tree-file> <catalog|extents|attributes>");
            };
            let json = args.any(|arg| arg == "--json");
            let path = Path::new(&path);
            match TreeKind::parse(&kind)? {
                TreeKind::Catalog => check::<CatalogKey>(path, json),
                TreeKind::Extents => check::<ExtentKey>(path, json),
                TreeKind::Attributes => check::<AttributeKey>(path, json),
            }
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("hfs\n");
    println!("USAGE:");
    println!("  hfs inspect <tree-file> [--json]");
    println!("  hfs dump <tree-file> <catalog|extents|attributes> [--json]");
    println!("  hfs check <tree-file> <catalog|extents|attributes> [--json]");
}

fn open<K: BTreeKey>(path: &Path) -> Result<BTree<K>> {
    open_tree_file(path, None)
        .with_context(|| format!("failed to open B-tree file {}", path.display()))
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    // Header and node map do not depend on the key type.
    let tree: ExtentsTree = open(path)?;
    let output = InspectOutput {
        header: *tree.header(),
        node_usage: tree.node_usage().context("read node map")?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    let h = &output.header;
    println!("HFS+ B-tree Inspector");
    println!("node_size: {}", h.node_size);
    println!("depth: {}", h.tree_depth);
    println!("root_node: {}", h.root_node);
    println!("leaf_records: {}", h.leaf_records);
    println!("first_leaf_node: {}", h.first_leaf_node);
    println!("last_leaf_node: {}", h.last_leaf_node);
    println!("max_key_length: {}", h.max_key_length);
    println!("total_nodes: {}", h.total_nodes);
    println!("free_nodes: {}", h.free_nodes);
    println!("key_compare_type: {:#04x}", h.key_compare_type);
    println!("attributes: {:#010x}", h.attributes);
    println!("collation: {:?}", tree.collation());
    println!(
        "nodes_in_use (map): {}{}",
        output.node_usage.used_nodes_in_map,
        if output.node_usage.is_consistent() {
            ""
        } else {
            " (disagrees with free_nodes)"
        }
    );
    Ok(())
}

fn dump<K: BTreeKey + Display>(path: &Path, json: bool) -> Result<()> {
    let tree: BTree<K> = open(path)?;
    let mut entries = Vec::new();
    tree.walk_leaves(|key, payload| {
        entries.push(DumpEntry {
            key: key.to_string(),
            payload_len: payload.len(),
        });
    })
    .context("walk leaf chain")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize output")?
        );
    } else {
        for entry in &entries {
            println!("{} ({} bytes)", entry.key, entry.payload_len);
        }
        println!("{} records", entries.len());
    }
    Ok(())
}

fn check<K: BTreeKey>(path: &Path, json: bool) -> Result<()> {
    let tree: BTree<K> = open(path)?;
    let collation = tree.collation();

    let walked = tree.walk_leaves(|_, _| {}).context("walk leaf chain")?;

    let mut visited = 0_usize;
    let mut keys_ascending = true;
    let mut previous: Option<K> = None;
    tree.visit_range(&mut |key: &K, payload: Option<&[u8]>| {
        if payload.is_some() {
            if let Some(prev) = &previous {
                keys_ascending &= prev.compare_with(key, collation) == Ordering::Less;
            }
            previous = Some(key.clone());
            visited += 1;
        }
        Ordering::Equal
    })
    .context("descend from root")?;

    let report = CheckReport {
        leaf_records_declared: tree.header().leaf_records,
        leaf_records_walked: walked,
        leaf_records_visited: visited,
        keys_ascending,
        node_usage: tree.node_usage().context("read node map")?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else {
        println!("leaf records (header): {}", report.leaf_records_declared);
        println!("leaf records (chain):  {}", report.leaf_records_walked);
        println!("leaf records (root):   {}", report.leaf_records_visited);
        println!("keys ascending: {}", report.keys_ascending);
        println!(
            "nodes in use: {} of {} (header says {} free)",
            report.node_usage.used_nodes_in_map,
            report.node_usage.total_nodes,
            report.node_usage.free_nodes_declared
        );
    }

    if !report.is_clean() {
        bail!("{} tree is inconsistent", K::KIND);
    }
    Ok(())
}
