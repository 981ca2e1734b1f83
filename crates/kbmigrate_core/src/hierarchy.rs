use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};

use crate::destination::DestinationApi;
use crate::error::{ErrorKind, RemoteError, error_kind};
use crate::mapping::{IdentityMap, SourceId};
use crate::source::{SourceApi, SourceCategory, SourceFolder};

/// Source folder visibility tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Authenticated,
    Internal,
}

impl Visibility {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Public),
            2 => Some(Self::Authenticated),
            3 => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Public => 1,
            Self::Authenticated => 2,
            Self::Internal => 3,
        }
    }
}

/// Destination `isinternal` flag for a node. Only public content is external.
pub fn is_internal(visibility: Option<Visibility>) -> bool {
    visibility != Some(Visibility::Public)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLevel {
    Category,
    Folder,
    Subfolder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryNode {
    pub source_id: SourceId,
    pub name: String,
    pub description: Option<String>,
    pub article_count: u64,
    pub child_folder_count: u64,
    pub parent_id: Option<SourceId>,
    pub visibility: Option<Visibility>,
    pub level: NodeLevel,
}

impl CategoryNode {
    pub fn from_category(category: &SourceCategory) -> Self {
        Self {
            source_id: category.id,
            name: category.name.clone(),
            description: category.description.clone(),
            article_count: 0,
            child_folder_count: 0,
            parent_id: None,
            visibility: None,
            level: NodeLevel::Category,
        }
    }

    pub fn from_folder(folder: &SourceFolder, parent_id: SourceId, level: NodeLevel) -> Self {
        Self {
            source_id: folder.id,
            name: folder.name.clone(),
            description: folder.description.clone(),
            article_count: folder.articles_count,
            child_folder_count: folder.sub_folders_count,
            parent_id: Some(parent_id),
            visibility: folder.visibility.and_then(Visibility::from_code),
            level,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.level == NodeLevel::Category
    }

    pub fn is_parent_folder(&self) -> bool {
        self.level == NodeLevel::Folder
    }

    pub fn is_internal(&self) -> bool {
        is_internal(self.visibility)
    }
}

/// A category's folders followed by their subfolders.
pub fn collect_folders<S: SourceApi + ?Sized>(
    source: &mut S,
    category: &SourceCategory,
) -> Result<Vec<CategoryNode>> {
    let folders = source.list_folders(category.id)?;
    let mut nodes: Vec<CategoryNode> = folders
        .iter()
        .map(|folder| CategoryNode::from_folder(folder, category.id, NodeLevel::Folder))
        .collect();
    for folder in folders.iter().filter(|folder| folder.sub_folders_count > 0) {
        for subfolder in source.list_subfolders(folder.id)? {
            let parent = subfolder.parent_folder_id.unwrap_or(folder.id);
            nodes.push(CategoryNode::from_folder(
                &subfolder,
                parent,
                NodeLevel::Subfolder,
            ));
        }
    }
    tracing::info!(
        "found {} folders in category {} ({})",
        nodes.len(),
        category.id,
        category.name
    );
    Ok(nodes)
}

/// Parents before children. Nodes whose parent is outside the set keep their
/// relative order; cycles are appended unchanged and fail at import time.
pub fn dependency_order(nodes: &[CategoryNode]) -> Vec<CategoryNode> {
    let present: BTreeSet<SourceId> = nodes.iter().map(|node| node.source_id).collect();
    let mut placed = BTreeSet::new();
    let mut ordered = Vec::with_capacity(nodes.len());
    let mut pending: Vec<&CategoryNode> = nodes.iter().collect();
    loop {
        let before = pending.len();
        pending.retain(|node| {
            let ready = match node.parent_id {
                None => true,
                Some(parent) => !present.contains(&parent) || placed.contains(&parent),
            };
            if ready {
                placed.insert(node.source_id);
                ordered.push((*node).clone());
            }
            !ready
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    ordered.extend(pending.into_iter().cloned());
    ordered
}

pub fn build_category_payload(node: &CategoryNode, map: &IdentityMap) -> Result<Value> {
    let mut payload = json!({
        "title": node.name,
        "description": node.description,
        "revops_freshdeskcategoryid": node.source_id,
        "revops_istoplevelcategory": node.is_top_level(),
    });
    if node.is_top_level() {
        return Ok(payload);
    }
    let parent_id = node.parent_id.ok_or_else(|| RemoteError::OrderingViolation {
        entity: format!("category {}", node.source_id),
        parent_id: 0,
    })?;
    let parent = map
        .category(parent_id)
        .ok_or_else(|| RemoteError::OrderingViolation {
            entity: format!("category {} ({})", node.source_id, node.name),
            parent_id,
        })?;
    payload["revops_isinternal"] = Value::Bool(node.is_internal());
    payload["parentcategoryid@odata.bind"] =
        Value::String(format!("/categories({})", parent.category_id));
    Ok(payload)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    pub source_id: SourceId,
    pub name: String,
    pub ordering_violation: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub existing: usize,
    pub failures: Vec<ImportFailure>,
}

impl ImportReport {
    pub fn absorb(&mut self, other: ImportReport) {
        self.created += other.created;
        self.existing += other.existing;
        self.failures.extend(other.failures);
    }
}

/// Create every node missing from the destination, parents first.
///
/// Nodes already present in `map` (matched by source id) are left alone, so a
/// rerun against a populated destination creates nothing.
pub fn import_categories<D: DestinationApi + ?Sized>(
    destination: &mut D,
    nodes: &[CategoryNode],
    map: &mut IdentityMap,
) -> ImportReport {
    let mut report = ImportReport::default();
    for node in dependency_order(nodes) {
        if map.category(node.source_id).is_some() {
            report.existing += 1;
            continue;
        }
        match import_one(destination, &node, map) {
            Ok(()) => report.created += 1,
            Err(error) => {
                let ordering_violation = error_kind(&error) == ErrorKind::OrderingViolation;
                tracing::error!(
                    "failed to create category {} ({}): {error:#}",
                    node.source_id,
                    node.name
                );
                report.failures.push(ImportFailure {
                    source_id: node.source_id,
                    name: node.name.clone(),
                    ordering_violation,
                    error: format!("{error:#}"),
                });
            }
        }
    }
    tracing::info!(
        "category import: {} created, {} existing, {} failed",
        report.created,
        report.existing,
        report.failures.len()
    );
    report
}

fn import_one<D: DestinationApi + ?Sized>(
    destination: &mut D,
    node: &CategoryNode,
    map: &mut IdentityMap,
) -> Result<()> {
    let payload = build_category_payload(node, map)?;
    let record = destination.create_category(&payload)?;
    tracing::info!(
        "created category {} ({}) as {}",
        node.source_id,
        node.name,
        record.category_id
    );
    map.record_category(node.source_id, record);
    Ok(())
}

/// Every node's folder-level visibility, keyed by source id.
pub fn internal_flags(nodes: &[CategoryNode]) -> BTreeMap<SourceId, bool> {
    nodes
        .iter()
        .map(|node| (node.source_id, node.is_internal()))
        .collect()
}
