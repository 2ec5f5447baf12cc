#![allow(dead_code)]

use sd_job_orchestrator::{Delivery, ProgressEvent, Subscription};

pub mod executors;

/// Drains a subscription until it closes, flattening batches
pub async fn collect(subscription: &Subscription) -> Vec<ProgressEvent> {
	let mut events = Vec::new();

	while let Some(delivery) = subscription.recv().await {
		events.extend(delivery.into_events());
	}

	events
}

pub async fn next_events(subscription: &Subscription) -> Vec<ProgressEvent> {
	subscription
		.recv()
		.await
		.map(Delivery::into_events)
		.unwrap_or_default()
}

pub fn sequences(events: &[ProgressEvent]) -> Vec<u64> {
	events.iter().map(|event| event.sequence).collect()
}

pub fn assert_strictly_ordered(events: &[ProgressEvent]) {
	assert!(
		events
			.windows(2)
			.all(|pair| pair[0].sequence < pair[1].sequence),
		"sequences out of order: {:?}",
		sequences(events)
	);
}
