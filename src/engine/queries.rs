use std::collections::BTreeSet;

use serde::Serialize;

use crate::model::*;

use super::{CallContext, Engine, EngineError};

/// Active wishes in display order, plus every tag seen on an active wish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WishListing {
    pub wishes: Vec<Wish>,
    /// Sorted and unique; collected before the tag filter is applied.
    pub tags: Vec<String>,
}

impl Engine {
    pub async fn get_wish(&self, name: &str, ctx: &CallContext) -> Result<Wish, EngineError> {
        ctx.run(async { Ok(self.store.get(&self.namespace, name).await?) })
            .await
    }

    /// Wishes the reconciler has marked active, highest priority first, then by
    /// title. `tag` keeps only wishes carrying it in `tags` or `contextTags`.
    pub async fn list_active(
        &self,
        tag: Option<&str>,
        ctx: &CallContext,
    ) -> Result<WishListing, EngineError> {
        let all = ctx
            .run(async { Ok(self.store.list(&self.namespace).await?) })
            .await?;
        Ok(listing(all, tag))
    }

    pub async fn list_names(&self, ctx: &CallContext) -> Result<Vec<String>, EngineError> {
        let all = ctx
            .run(async { Ok(self.store.list(&self.namespace).await?) })
            .await?;
        Ok(all.into_iter().map(|w| w.metadata.name).collect())
    }
}

fn listing(all: Vec<Wish>, tag: Option<&str>) -> WishListing {
    let tag = tag.filter(|t| !t.is_empty());
    let mut tags = BTreeSet::new();
    let mut wishes = Vec::new();
    for wish in all.into_iter().filter(|w| w.status.active) {
        tags.extend(wish.spec.tags.iter().cloned());
        tags.extend(wish.spec.context_tags.iter().cloned());
        if tag.is_none_or(|t| wish.spec.has_tag(t)) {
            wishes.push(wish);
        }
    }
    wishes.sort_by(|a, b| {
        b.spec
            .priority
            .cmp(&a.spec.priority)
            .then_with(|| a.spec.title.cmp(&b.spec.title))
    });
    WishListing {
        wishes,
        tags: tags.into_iter().collect(),
    }
}
