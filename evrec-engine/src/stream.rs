// ---------------------------------------------------------------------------
// Stream abstraction: partitioned log with explicit commits
// ---------------------------------------------------------------------------
//
// `Consumer` and `Producer` are the seam between the pipeline and whatever
// transports records. Polling never commits: a consumer's committed offset
// only moves on `commit()`, and a consumer created later resumes from the
// committed offset, so anything polled but not committed is delivered again.
//
// `MemoryLog` is the in-process implementation: ordered per partition,
// partition chosen by `key mod partitions`, pollers woken on append.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum StreamError {
	#[error("Stream closed")]
	Closed,
	#[error("Stream unavailable: {0}")]
	Unavailable(String),
	#[error("Partition {partition} out of range for topic '{topic}'")]
	UnknownPartition { topic: String, partition: usize },
}

/// One record as seen by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
	pub topic: String,
	pub partition: usize,
	pub offset: u64,
	pub key: i64,
	pub payload: Vec<u8>,
}

/// Which topic partition a consumer reads, on behalf of which group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Assignment {
	pub topic: String,
	pub group: String,
	pub partition: usize,
}

#[async_trait]
pub trait Consumer: Send {
	/// Wait up to `timeout` for records past the current position.
	/// Returns an empty batch on timeout. Cancel-safe: the position only
	/// moves when a batch is returned.
	async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>, StreamError>;

	/// Commit the position reached by the last returned batch.
	async fn commit(&mut self) -> Result<(), StreamError>;

	fn assignment(&self) -> &Assignment;
}

#[async_trait]
pub trait Producer: Send + Sync {
	async fn send(&self, topic: &str, key: i64, payload: Vec<u8>) -> Result<(), StreamError>;

	/// Block until everything sent so far is durable.
	async fn flush(&self) -> Result<(), StreamError>;
}

// ---------------------------------------------------------------------------
// MemoryLog
// ---------------------------------------------------------------------------

struct TopicLog {
	partitions: Vec<Vec<(i64, Vec<u8>)>>,
	committed: HashMap<(String, usize), u64>,
	appended: watch::Sender<u64>,
}

impl TopicLog {
	fn new(partitions: usize) -> Self {
		let (appended, _) = watch::channel(0);
		Self {
			partitions: vec![Vec::new(); partitions],
			committed: HashMap::new(),
			appended,
		}
	}
}

/// In-process partitioned, ordered, at-least-once log.
pub struct MemoryLog {
	partitions: usize,
	topics: Mutex<HashMap<String, TopicLog>>,
}

impl MemoryLog {
	pub fn new(partitions: usize) -> Arc<Self> {
		Arc::new(Self {
			partitions: partitions.max(1),
			topics: Mutex::new(HashMap::new()),
		})
	}

	pub fn partition_for(&self, key: i64) -> usize {
		key.rem_euclid(self.partitions as i64) as usize
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
		self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Append a record and return its (partition, offset).
	pub fn append(&self, topic: &str, key: i64, payload: Vec<u8>) -> (usize, u64) {
		let partition = self.partition_for(key);
		let mut topics = self.lock();
		let log = topics
			.entry(topic.to_string())
			.or_insert_with(|| TopicLog::new(self.partitions));
		let records = &mut log.partitions[partition];
		records.push((key, payload));
		let offset = records.len() as u64 - 1;
		log.appended.send_modify(|n| *n += 1);
		(partition, offset)
	}

	/// Number of records ever appended to a partition.
	pub fn end_offset(&self, topic: &str, partition: usize) -> u64 {
		self.lock()
			.get(topic)
			.and_then(|log| log.partitions.get(partition))
			.map_or(0, |records| records.len() as u64)
	}

	/// Committed offset for a group on a partition (0 if never committed).
	pub fn committed(&self, topic: &str, group: &str, partition: usize) -> u64 {
		self.lock()
			.get(topic)
			.and_then(|log| log.committed.get(&(group.to_string(), partition)))
			.copied()
			.unwrap_or(0)
	}

	/// Records not yet committed by `group`, across all partitions.
	pub fn lag(&self, topic: &str, group: &str) -> u64 {
		(0..self.partitions)
			.map(|p| {
				self.end_offset(topic, p)
					.saturating_sub(self.committed(topic, group, p))
			})
			.sum()
	}

	/// Create a consumer for one partition, positioned at the group's
	/// committed offset.
	pub fn consumer(
		self: &Arc<Self>,
		topic: &str,
		group: &str,
		partition: usize,
		max_poll_records: usize,
	) -> Result<MemoryConsumer, StreamError> {
		if partition >= self.partitions {
			return Err(StreamError::UnknownPartition {
				topic: topic.to_string(),
				partition,
			});
		}
		let mut topics = self.lock();
		let log = topics
			.entry(topic.to_string())
			.or_insert_with(|| TopicLog::new(self.partitions));
		let position = log
			.committed
			.get(&(group.to_string(), partition))
			.copied()
			.unwrap_or(0);
		let appended = log.appended.subscribe();
		drop(topics);

		Ok(MemoryConsumer {
			log: Arc::clone(self),
			assignment: Assignment {
				topic: topic.to_string(),
				group: group.to_string(),
				partition,
			},
			position,
			max_poll_records: max_poll_records.max(1),
			appended,
		})
	}

	pub fn producer(self: &Arc<Self>) -> MemoryProducer {
		MemoryProducer {
			log: Arc::clone(self),
		}
	}

	fn read(&self, assignment: &Assignment, from: u64, max: usize) -> Vec<Record> {
		let topics = self.lock();
		let Some(records) = topics
			.get(&assignment.topic)
			.and_then(|log| log.partitions.get(assignment.partition))
		else {
			return Vec::new();
		};
		records
			.iter()
			.enumerate()
			.skip(from as usize)
			.take(max)
			.map(|(offset, (key, payload))| Record {
				topic: assignment.topic.clone(),
				partition: assignment.partition,
				offset: offset as u64,
				key: *key,
				payload: payload.clone(),
			})
			.collect()
	}

	fn commit_offset(&self, assignment: &Assignment, offset: u64) {
		let mut topics = self.lock();
		if let Some(log) = topics.get_mut(&assignment.topic) {
			let slot = log
				.committed
				.entry((assignment.group.clone(), assignment.partition))
				.or_insert(0);
			*slot = (*slot).max(offset);
		}
	}
}

// ---------------------------------------------------------------------------
// MemoryConsumer / MemoryProducer
// ---------------------------------------------------------------------------

pub struct MemoryConsumer {
	log: Arc<MemoryLog>,
	assignment: Assignment,
	position: u64,
	max_poll_records: usize,
	appended: watch::Receiver<u64>,
}

impl MemoryConsumer {
	/// Next offset this consumer will read.
	pub fn position(&self) -> u64 {
		self.position
	}
}

#[async_trait]
impl Consumer for MemoryConsumer {
	async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>, StreamError> {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			// Mark the current append count as seen before reading so an
			// append racing with the read still wakes us.
			self.appended.borrow_and_update();
			let batch = self
				.log
				.read(&self.assignment, self.position, self.max_poll_records);
			if let Some(last) = batch.last() {
				self.position = last.offset + 1;
				return Ok(batch);
			}

			match tokio::time::timeout_at(deadline, self.appended.changed()).await {
				Ok(Ok(())) => continue,
				Ok(Err(_)) => return Err(StreamError::Closed),
				Err(_) => return Ok(Vec::new()),
			}
		}
	}

	async fn commit(&mut self) -> Result<(), StreamError> {
		self.log.commit_offset(&self.assignment, self.position);
		Ok(())
	}

	fn assignment(&self) -> &Assignment {
		&self.assignment
	}
}

#[derive(Clone)]
pub struct MemoryProducer {
	log: Arc<MemoryLog>,
}

#[async_trait]
impl Producer for MemoryProducer {
	async fn send(&self, topic: &str, key: i64, payload: Vec<u8>) -> Result<(), StreamError> {
		self.log.append(topic, key, payload);
		Ok(())
	}

	async fn flush(&self) -> Result<(), StreamError> {
		Ok(())
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	const TOPIC: &str = "actions";

	#[tokio::test]
	async fn poll_times_out_with_empty_batch() {
		let log = MemoryLog::new(1);
		let mut consumer = log.consumer(TOPIC, "g", 0, 10).unwrap();
		let batch = consumer.poll(Duration::from_millis(10)).await.unwrap();
		assert!(batch.is_empty());
	}

	#[tokio::test]
	async fn poll_wakes_on_append() {
		let log = MemoryLog::new(1);
		let mut consumer = log.consumer(TOPIC, "g", 0, 10).unwrap();
		let producer = log.producer();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			producer.send(TOPIC, 1, vec![1, 2, 3]).await.unwrap();
		});
		let batch = consumer.poll(Duration::from_secs(5)).await.unwrap();
		handle.await.unwrap();
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].payload, vec![1, 2, 3]);
		assert_eq!(batch[0].offset, 0);
	}

	#[tokio::test]
	async fn uncommitted_records_are_redelivered() {
		let log = MemoryLog::new(1);
		log.append(TOPIC, 1, vec![1]);
		log.append(TOPIC, 1, vec![2]);

		let mut first = log.consumer(TOPIC, "g", 0, 10).unwrap();
		assert_eq!(first.poll(Duration::from_millis(10)).await.unwrap().len(), 2);
		drop(first);

		let mut second = log.consumer(TOPIC, "g", 0, 1).unwrap();
		let batch = second.poll(Duration::from_millis(10)).await.unwrap();
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].payload, vec![1]);
		second.commit().await.unwrap();
		drop(second);

		let mut third = log.consumer(TOPIC, "g", 0, 10).unwrap();
		assert_eq!(third.position(), 1);
		let batch = third.poll(Duration::from_millis(10)).await.unwrap();
		assert_eq!(batch[0].payload, vec![2]);
		assert_eq!(log.lag(TOPIC, "g"), 1);
	}

	#[tokio::test]
	async fn groups_track_offsets_independently() {
		let log = MemoryLog::new(1);
		log.append(TOPIC, 1, vec![9]);
		let mut a = log.consumer(TOPIC, "a", 0, 10).unwrap();
		a.poll(Duration::from_millis(10)).await.unwrap();
		a.commit().await.unwrap();
		assert_eq!(log.committed(TOPIC, "a", 0), 1);
		assert_eq!(log.committed(TOPIC, "b", 0), 0);
		assert_eq!(log.lag(TOPIC, "b"), 1);
	}

	#[test]
	fn keys_route_to_stable_partitions() {
		let log = MemoryLog::new(4);
		assert_eq!(log.partition_for(5), 1);
		assert_eq!(log.partition_for(-1), 3);
		let (p1, o1) = log.append(TOPIC, 5, vec![]);
		let (p2, o2) = log.append(TOPIC, 9, vec![]);
		assert_eq!((p1, o1), (1, 0));
		assert_eq!((p2, o2), (1, 1));
		assert_eq!(log.end_offset(TOPIC, 1), 2);
		assert_eq!(log.end_offset(TOPIC, 0), 0);
	}

	#[test]
	fn out_of_range_partition_is_rejected() {
		let log = MemoryLog::new(2);
		assert!(log.consumer(TOPIC, "g", 2, 10).is_err());
	}
}
