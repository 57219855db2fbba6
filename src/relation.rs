use std::collections::HashSet;
use std::fs;
use std::path::Path;

use failure::{bail, Error, ResultExt};
use serde::{Deserialize, Serialize};

/// One node of a denormalization tree.
///
/// The root of a tree names the output (`DenormalizedName`); every non-root
/// node names the pair of fields joining it to its parent: the child's
/// `JoinKey` value is matched against the parent's `ParentKey` value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct Relation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denormalized_name: Option<String>,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Relation>,
}

impl Relation {
    /// The output name; only roots have one.
    pub fn denormalized_name(&self) -> &str {
        self.denormalized_name
            .as_deref()
            .expect("denormalized_name read off a non-root relation")
    }

    /// Searches this tree for `entity`, depth-first, first match wins.
    ///
    /// Returns `(parent, matched)`; `parent` is `None` exactly when the
    /// entity is this tree's root. A repeated entity deeper in the tree is
    /// shadowed by the first match, and all indices for a shared entity are
    /// addressed by the canonical name, so duplicate subtrees share join
    /// state deliberately.
    pub fn find<'a>(&'a self, entity: &str) -> Option<(Option<&'a Relation>, &'a Relation)> {
        if self.entity == entity {
            return Some((None, self));
        }
        for child in &self.children {
            if child.entity == entity {
                return Some((Some(self), child));
            }
            if let Some(found) = child.find(entity) {
                return Some(found);
            }
        }
        None
    }

    /// Every entity named in this tree, root first, depth-first.
    pub fn entities(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_entities(&mut out);
        out
    }

    fn collect_entities<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.push(&self.entity);
        for child in &self.children {
            child.collect_entities(out);
        }
    }
}

/// Loads root relations from one or more JSON files, each an array of
/// trees. A `file://` prefix is accepted and stripped.
pub fn load_relations<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Relation>, Error> {
    let mut roots = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let display = path.display().to_string();
        let display = display.strip_prefix("file://").unwrap_or(&display);
        let raw = fs::read_to_string(display)
            .with_context(|_| format!("could not read relations file {}", display))?;
        let trees: Vec<Relation> = serde_json::from_str(&raw)
            .with_context(|_| format!("could not parse relations file {}", display))?;
        roots.extend(trees);
    }
    validate_roots(&roots)?;
    Ok(roots)
}

/// Validates a set of root relations before the driver starts.
pub fn validate_roots(roots: &[Relation]) -> Result<(), Error> {
    if roots.is_empty() {
        bail!("no relations configured");
    }
    let mut outputs = HashSet::new();
    for root in roots {
        let name = match root.denormalized_name {
            Some(ref name) if !name.is_empty() => name,
            _ => bail!(
                "root relation '{}' must have a denormalized object name",
                root.entity
            ),
        };
        if root.entity.is_empty() {
            bail!("root relation '{}' must name an input entity", name);
        }
        if root.join_key.is_some() || root.parent_key.is_some() {
            bail!("root relation '{}' must not declare join keys", name);
        }
        if !outputs.insert(name.as_str()) {
            bail!("two root relations share the output name '{}'", name);
        }
        for child in &root.children {
            validate_child(child)?;
        }
    }
    Ok(())
}

fn validate_child(relation: &Relation) -> Result<(), Error> {
    if relation.entity.is_empty() {
        bail!("a child relation must name an input entity");
    }
    if relation.denormalized_name.is_some() {
        bail!(
            "child relation '{}' must not declare a denormalized object name",
            relation.entity
        );
    }
    if relation.join_key.is_none() {
        bail!("child relation '{}' must have a join key", relation.entity);
    }
    if relation.parent_key.is_none() {
        bail!("child relation '{}' must have a parent key", relation.entity);
    }
    for child in &relation.children {
        validate_child(child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_tree() -> Relation {
        serde_json::from_str(
            r#"{
                "DenormalizedName": "feed",
                "Entity": "media",
                "Children": [
                    {
                        "Entity": "caption",
                        "JoinKey": "media_id",
                        "ParentKey": "id",
                        "Children": [
                            {"Entity": "cue", "JoinKey": "caption_id", "ParentKey": "id"}
                        ]
                    },
                    {"Entity": "tag", "JoinKey": "media_id", "ParentKey": "id"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_schema_field_names() {
        let tree = media_tree();
        assert_eq!(tree.denormalized_name(), "feed");
        assert_eq!(tree.entity, "media");
        assert_eq!(tree.children[0].join_key.as_deref(), Some("media_id"));
        assert_eq!(tree.children[0].parent_key.as_deref(), Some("id"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let res: Result<Relation, _> =
            serde_json::from_str(r#"{"Entity": "media", "Extra": true}"#);
        assert!(res.is_err());
    }

    #[test]
    fn find_walks_depth_first() {
        let tree = media_tree();

        let (parent, matched) = tree.find("media").unwrap();
        assert!(parent.is_none());
        assert_eq!(matched.entity, "media");

        let (parent, matched) = tree.find("cue").unwrap();
        assert_eq!(parent.unwrap().entity, "caption");
        assert_eq!(matched.entity, "cue");

        let (parent, matched) = tree.find("tag").unwrap();
        assert_eq!(parent.unwrap().entity, "media");
        assert_eq!(matched.entity, "tag");

        assert!(tree.find("unrelated").is_none());
    }

    #[test]
    fn find_first_match_wins() {
        let mut tree = media_tree();
        // a second `tag` subtree deeper in the tree is shadowed
        tree.children[0].children.push(Relation {
            denormalized_name: None,
            entity: "tag".to_string(),
            join_key: Some("caption_id".to_string()),
            parent_key: Some("id".to_string()),
            children: vec![],
        });
        let (parent, _) = tree.find("tag").unwrap();
        assert_eq!(parent.unwrap().entity, "caption");
    }

    #[test]
    fn entities_lists_whole_tree() {
        assert_eq!(
            media_tree().entities(),
            vec!["media", "caption", "cue", "tag"]
        );
    }

    #[test]
    fn validation() {
        let tree = media_tree();
        assert!(validate_roots(&[tree.clone()]).is_ok());

        // a childless root is a legal single-table materialization
        let flat = Relation {
            denormalized_name: Some("feed".to_string()),
            entity: "media".to_string(),
            join_key: None,
            parent_key: None,
            children: vec![],
        };
        assert!(validate_roots(&[flat]).is_ok());

        let mut no_name = tree.clone();
        no_name.denormalized_name = None;
        assert!(validate_roots(&[no_name]).is_err());

        let mut keyed_root = tree.clone();
        keyed_root.join_key = Some("id".to_string());
        assert!(validate_roots(&[keyed_root]).is_err());

        let mut keyless_child = tree.clone();
        keyless_child.children[0].join_key = None;
        assert!(validate_roots(&[keyless_child]).is_err());

        let mut named_child = tree.clone();
        named_child.children[0].denormalized_name = Some("oops".to_string());
        assert!(validate_roots(&[named_child]).is_err());

        assert!(validate_roots(&[tree.clone(), tree]).is_err());
        assert!(validate_roots(&[]).is_err());
    }
}
