use super::models::Permission;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct PermissionNode {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub content_type: Option<String>,
    pub action: Option<String>,
    pub sort_order: i32,
    pub is_active: bool,
    #[schema(no_recursion)]
    pub children: Vec<PermissionNode>,
}

/// Build the forest of `permissions`, siblings ordered by (`sort_order`, `id`).
///
/// Permissions whose parent is not part of the input become roots.
#[must_use]
pub fn build(permissions: &[Permission]) -> Vec<PermissionNode> {
    let known: HashSet<i64> = permissions.iter().map(|p| p.id).collect();
    let mut children: BTreeMap<Option<i64>, Vec<&Permission>> = BTreeMap::new();
    for permission in permissions {
        let parent = permission.parent_id.filter(|id| known.contains(id));
        children.entry(parent).or_default().push(permission);
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|p| (p.sort_order, p.id));
    }

    let mut visited = HashSet::new();
    attach(None, &children, &mut visited)
}

fn attach(
    parent: Option<i64>,
    children: &BTreeMap<Option<i64>, Vec<&Permission>>,
    visited: &mut HashSet<i64>,
) -> Vec<PermissionNode> {
    let Some(siblings) = children.get(&parent) else {
        return Vec::new();
    };
    let mut nodes = Vec::with_capacity(siblings.len());
    for permission in siblings {
        if !visited.insert(permission.id) {
            continue;
        }
        nodes.push(PermissionNode {
            id: permission.id,
            name: permission.name.clone(),
            code: permission.code.clone(),
            content_type: permission.content_type.clone(),
            action: permission.action.clone(),
            sort_order: permission.sort_order,
            is_active: permission.is_active,
            children: attach(Some(permission.id), children, visited),
        });
    }
    nodes
}

/// Would placing `permission_id` under `new_parent` close a loop?
///
/// Walks the ancestors of `new_parent` through `parents` (id to parent id).
#[must_use]
pub fn creates_cycle(parents: &HashMap<i64, Option<i64>>, permission_id: i64, new_parent: i64) -> bool {
    let mut seen = HashSet::new();
    let mut cursor = Some(new_parent);
    while let Some(id) = cursor {
        if id == permission_id {
            return true;
        }
        if !seen.insert(id) {
            // pre-existing loop that does not involve `permission_id`
            return false;
        }
        cursor = parents.get(&id).copied().flatten();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn permission(id: i64, parent_id: Option<i64>, sort_order: i32) -> Permission {
        let now = Utc::now();
        Permission {
            id,
            name: format!("p{id}"),
            code: format!("res:p{id}"),
            content_type: Some("res".to_string()),
            action: Some(format!("p{id}")),
            description: None,
            parent_id,
            sort_order,
            is_active: true,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn builds_sorted_forest() {
        let list = vec![
            permission(1, None, 2),
            permission(2, None, 1),
            permission(3, Some(1), 2),
            permission(4, Some(1), 1),
            permission(5, Some(4), 0),
        ];
        let tree = build(&list);
        assert_eq!(tree.iter().map(|n| n.id).collect::<Vec<_>>(), vec![2, 1]);
        let first = &tree[1];
        assert_eq!(
            first.children.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![4, 3]
        );
        assert_eq!(first.children[0].children[0].id, 5);
    }

    #[test]
    fn orphans_become_roots() {
        let tree = build(&[permission(7, Some(99), 0)]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, 7);
    }

    #[test]
    fn detects_descendant_as_parent() {
        // 1 <- 2 <- 3
        let parents = HashMap::from([(1, None), (2, Some(1)), (3, Some(2))]);
        assert!(creates_cycle(&parents, 1, 3));
        assert!(creates_cycle(&parents, 1, 1));
        assert!(!creates_cycle(&parents, 3, 1));
    }

    #[test]
    fn tolerates_existing_loops() {
        let parents = HashMap::from([(1, Some(2)), (2, Some(1)), (3, None)]);
        assert!(!creates_cycle(&parents, 3, 1));
    }
}
