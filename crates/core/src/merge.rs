//! Merge rules for folding extracted mentions into graph records
//!
//! Every function here is pure and order-independent: mentions are grouped
//! and sorted before they are folded, descriptions are kept as a sorted set,
//! and provenance is a sorted union.

use crate::entity::{Entity, EntityMention, UNKNOWN_ENTITY_TYPE};
use crate::relation::{Relation, RelationMention};
use std::collections::{BTreeMap, BTreeSet};

/// Separator between merged description fragments and provenance ids
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

/// Split a stored description back into its fragments.
pub fn split_descriptions(description: &str) -> Vec<String> {
    description
        .split(GRAPH_FIELD_SEP)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sorted, de-duplicated union of the existing description fragments and `new`.
pub fn merge_descriptions<'a, I>(existing: &str, new: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut set: BTreeSet<String> = split_descriptions(existing).into_iter().collect();
    for description in new {
        let description = description.trim();
        if !description.is_empty() {
            set.insert(description.to_string());
        }
    }
    set.into_iter().collect::<Vec<_>>().join(GRAPH_FIELD_SEP)
}

/// Sorted union of chunk ids
pub fn merge_source_ids<'a, I>(existing: &[String], new: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut set: BTreeSet<String> = existing.iter().cloned().collect();
    set.extend(new.into_iter().map(str::to_string));
    set.into_iter().collect()
}

/// Group entity mentions by canonical id. Mentions inside a group are sorted
/// by provenance so that folding them is independent of arrival order.
pub fn group_entity_mentions(
    mentions: impl IntoIterator<Item = EntityMention>,
) -> BTreeMap<String, Vec<EntityMention>> {
    let mut groups: BTreeMap<String, Vec<EntityMention>> = BTreeMap::new();
    for mention in mentions {
        let id = mention.id();
        if id.is_empty() {
            continue;
        }
        groups.entry(id).or_default().push(mention);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            (&a.source_id, &a.name, &a.entity_type, &a.description).cmp(&(
                &b.source_id,
                &b.name,
                &b.entity_type,
                &b.description,
            ))
        });
    }
    groups
}

/// Group relation mentions by unordered endpoint pair, dropping self-loops.
pub fn group_relation_mentions(
    mentions: impl IntoIterator<Item = RelationMention>,
) -> BTreeMap<(String, String), Vec<RelationMention>> {
    let mut groups: BTreeMap<(String, String), Vec<RelationMention>> = BTreeMap::new();
    for mention in mentions {
        let key = mention.key();
        if key.0.is_empty() || key.1.is_empty() || key.0 == key.1 {
            continue;
        }
        groups.entry(key).or_default().push(mention);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| a.description.cmp(&b.description))
                .then_with(|| a.weight.total_cmp(&b.weight))
        });
    }
    groups
}

/// Fold a group of mentions for one entity into the existing record (if any).
///
/// The result's description is the raw merged fragment set; callers decide
/// whether it needs summarizing.
pub fn merge_entity(existing: Option<&Entity>, mentions: &[EntityMention]) -> Option<Entity> {
    let first = mentions.first()?;
    let mut entity = match existing {
        Some(entity) => entity.clone(),
        None => Entity::new(first.name.trim()),
    };
    if entity.name.is_empty() || is_placeholder(&entity) {
        entity.name = first.name.trim().to_string();
    }
    for mention in mentions {
        entity.vote_type(&mention.entity_type);
    }
    entity.entity_type = entity.resolved_type();
    entity.description = merge_descriptions(
        &entity.description,
        mentions.iter().map(|m| m.description.as_str()),
    );
    entity.source_ids = merge_source_ids(
        &entity.source_ids,
        mentions.iter().map(|m| m.source_id.as_str()),
    );
    Some(entity)
}

/// Fold a group of mentions for one endpoint pair into the existing record (if any).
pub fn merge_relation(existing: Option<&Relation>, mentions: &[RelationMention]) -> Option<Relation> {
    let (src, tgt) = mentions.first()?.key();
    let mut relation = match existing {
        Some(relation) => relation.clone(),
        None => Relation::new(src, tgt),
    };
    relation.weight += mentions.iter().map(|m| m.weight).sum::<f64>();
    relation.description = merge_descriptions(
        &relation.description,
        mentions.iter().map(|m| m.description.as_str()),
    );
    relation.source_ids = merge_source_ids(
        &relation.source_ids,
        mentions.iter().map(|m| m.source_id.as_str()),
    );
    Some(relation)
}

/// Placeholders carry no type votes and no description; their name is the id.
fn is_placeholder(entity: &Entity) -> bool {
    entity.type_votes.is_empty() && entity.description.is_empty()
}

/// Entity created for a relation endpoint that was never extracted itself.
pub fn placeholder_entity(id: &str, source_ids: &[String]) -> Entity {
    let mut entity = Entity::new(id);
    entity.entity_type = UNKNOWN_ENTITY_TYPE.to_string();
    entity.source_ids = merge_source_ids(&[], source_ids.iter().map(String::as_str));
    entity
}
