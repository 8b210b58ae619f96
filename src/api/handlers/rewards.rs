//! Quest reward endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::instrument;

use crate::api::middleware::error::ApiError;
use crate::api::models::QuestRewardResponse;
use crate::app_state::AppState;
use crate::events::DecodedEvent;

#[utoipa::path(
    get,
    path = "/rewards/hero/{hero_id}",
    params(
        ("hero_id" = u64, Path, description = "Hero id")
    ),
    responses(
        (status = 200, description = "Quest rewards earned by the hero", body = [QuestRewardResponse])
    ),
    tag = "Rewards"
)]
/// Returns the decoded quest-reward history of one hero.
#[instrument(skip(state))]
pub async fn get_hero_rewards(
    State(state): State<AppState>,
    Path(hero_id): Path<u64>,
) -> Result<Json<Vec<QuestRewardResponse>>, ApiError> {
    let rows = state.repository.quest_rewards_for_hero(hero_id).await?;

    let mut rewards = Vec::with_capacity(rows.len());
    for row in rows {
        // Rows on this stream always hold a quest-reward payload; anything
        // else would be a writer bug, so it is skipped rather than served.
        let Ok(DecodedEvent::QuestReward {
            quest_id,
            player,
            hero_id,
            token,
            amount,
        }) = serde_json::from_str::<DecodedEvent>(&row.payload)
        else {
            continue;
        };

        rewards.push(QuestRewardResponse {
            quest_id: quest_id.to_string(),
            player: format!("{player:?}").to_lowercase(),
            hero_id: hero_id.to_string(),
            token: format!("{token:?}").to_lowercase(),
            amount_wei: amount.to_string(),
            block_number: row.block_number,
            block_timestamp: row.block_timestamp,
            tx_hash: row.tx_hash,
        });
    }

    Ok(Json(rewards))
}
