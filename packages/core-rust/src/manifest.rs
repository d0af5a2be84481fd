//! Serializable description of a compiled operation tree.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::module::RouteDescriptor;
use crate::types::OperationId;

/// How an operation is reachable over request/reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestRoute {
    /// `None` when any method is accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestOperation {
    pub id: OperationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<ManifestRoute>,
}

/// One level of the tree. A node may be both an operation and a branch when
/// two initializers contribute `a` and `a/b`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<ManifestOperation>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ManifestNode>,
}

impl ManifestNode {
    pub(crate) fn from_routes<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a OperationId, Option<&'a RouteDescriptor>)>,
    {
        let mut root = Self::default();
        for (id, route) in entries {
            let mut node = &mut root;
            for segment in id.segments() {
                node = node.children.entry(segment.to_owned()).or_default();
            }
            node.operation = Some(ManifestOperation {
                id: id.clone(),
                route: route.map(|r| ManifestRoute {
                    method: r.method.as_ref().map(ToString::to_string),
                    path: r.path.clone(),
                }),
            });
        }
        root
    }

    /// Looks up the node at a `/`-separated path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ManifestNode> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    /// All operations under this node, depth-first in key order.
    #[must_use]
    pub fn operations(&self) -> Vec<&ManifestOperation> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a ManifestOperation>) {
        if let Some(op) = &self.operation {
            out.push(op);
        }
        for child in self.children.values() {
            child.collect(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use serde_json::json;

    use crate::middleware::Reply;
    use crate::module::Module;
    use crate::procedure::OperationTree;

    #[test]
    fn manifest_mirrors_tree() {
        let compiled = Module::new("root")
            .procedures(|f| {
                OperationTree::new()
                    .operation("health", f.operation().handler_raw(|_i| async { Ok(Reply::Empty) }))
                    .branch(
                        "users",
                        OperationTree::new().operation(
                            "get",
                            f.operation()
                                .method(Method::GET)
                                .handler_raw(|_i| async { Ok(Reply::Empty) }),
                        ),
                    )
            })
            .build()
            .unwrap();

        let manifest = compiled.manifest();
        let ids: Vec<_> = manifest.operations().iter().map(|op| op.id.to_string()).collect();
        assert_eq!(ids, vec!["health", "users/get"]);

        let users = manifest.get("users/get").unwrap();
        assert_eq!(
            serde_json::to_value(users).unwrap(),
            json!({"operation": {"id": "users/get", "route": {"method": "GET", "path": "/users/get"}}})
        );
        assert!(manifest.get("users/missing").is_none());
        assert_eq!(
            serde_json::to_value(manifest.get("health").unwrap()).unwrap(),
            json!({"operation": {"id": "health"}})
        );
    }
}
