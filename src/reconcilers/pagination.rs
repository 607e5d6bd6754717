// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Paged list calls.
//!
//! Workers list their machines and backup schedules list their backups on every
//! pass. Both sets grow without bound, so they are fetched in pages.

use crate::constants::KUBE_LIST_PAGE_SIZE;
use anyhow::{Context as _, Result};
use kube::{api::ListParams, Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// List every object matching `list_params`, following continue tokens.
///
/// # Example
///
/// ```no_run
/// use kube::{Api, Client, api::ListParams};
/// use talos_operator::crd::TalosMachine;
/// use talos_operator::reconcilers::pagination::list_all_paginated;
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = Client::try_default().await?;
/// let api: Api<TalosMachine> = Api::namespaced(client, "default");
///
/// let machines = list_all_paginated(&api, ListParams::default()).await?;
/// println!("Found {} machines", machines.len());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if a list call fails.
pub async fn list_all_paginated<K>(api: &Api<K>, mut list_params: ListParams) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    list_params.limit = Some(KUBE_LIST_PAGE_SIZE);

    let mut all_items = Vec::new();
    let mut page_count = 0;

    loop {
        page_count += 1;
        let result = api
            .list(&list_params)
            .await
            .with_context(|| format!("failed to list {} (page {page_count})", K::plural(&())))?;

        let item_count = result.items.len();
        all_items.extend(result.items);

        debug!(
            page = page_count,
            items_in_page = item_count,
            total_items = all_items.len(),
            "Fetched page from Kubernetes API"
        );

        match result.metadata.continue_ {
            Some(token) if !token.is_empty() => list_params.continue_token = Some(token),
            _ => break,
        }
    }

    Ok(all_items)
}

#[cfg(test)]
#[path = "pagination_tests.rs"]
mod pagination_tests;
