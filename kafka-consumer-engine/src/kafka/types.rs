use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::TopicPartitionList;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Flatten an rdkafka assignment list into owned partitions
pub fn partitions_from_list(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("orders", 3);
        assert_eq!(partition.to_string(), "orders:3");
        assert_eq!(partition.topic(), "orders");
        assert_eq!(partition.partition_number(), 3);
    }

    #[test]
    fn test_partitions_from_list() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("orders", 0, Offset::Beginning)
            .unwrap();
        list.add_partition_offset("orders", 1, Offset::Beginning)
            .unwrap();
        list.add_partition("payments", 0);

        let partitions = partitions_from_list(&list);
        assert_eq!(
            partitions,
            vec![
                Partition::new("orders", 0),
                Partition::new("orders", 1),
                Partition::new("payments", 0),
            ]
        );
    }

    #[test]
    fn test_empty_list_yields_no_partitions() {
        let list = TopicPartitionList::new();
        assert_eq!(list.count(), 0);
        assert!(partitions_from_list(&list).is_empty());
    }
}
