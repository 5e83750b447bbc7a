//! Modify request and change classification.

use crate::ber::{Class, Packet};
use crate::control::Control;
use crate::entry::Attribute;
use crate::error::ProtocolError;
use crate::message::{application, Request};
use serde::{Deserialize, Serialize};

/// Modification operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<i64> for ChangeOperation {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChangeOperation::Add),
            1 => Ok(ChangeOperation::Delete),
            2 => Ok(ChangeOperation::Replace),
            other => Err(ProtocolError::UnsupportedChangeOperation(other)),
        }
    }
}

/// One modification of a modify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub operation: ChangeOperation,
    pub modification: Attribute,
}

impl Change {
    pub fn new(operation: ChangeOperation, modification: Attribute) -> Self {
        Self {
            operation,
            modification,
        }
    }

    fn encode(&self) -> Packet {
        Packet::sequence("Change")
            .with_child(Packet::enumerated(self.operation as i64, "Operation"))
            .with_child(self.modification.encode())
    }

    fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        let [operation, modification] = packet.children.as_slice() else {
            return Err(ProtocolError::InvalidPacket);
        };
        Ok(Self {
            operation: ChangeOperation::try_from(operation.as_int()?)?,
            modification: Attribute::decode(modification)?,
        })
    }
}

/// `[APPLICATION 6] ModifyRequest`. Changes are applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Change>,
    pub controls: Vec<Control>,
}

impl ModifyRequest {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            changes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn add(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.push(ChangeOperation::Add, name, values)
    }

    pub fn delete(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.push(ChangeOperation::Delete, name, values)
    }

    pub fn replace(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.push(ChangeOperation::Replace, name, values)
    }

    fn push(
        &mut self,
        operation: ChangeOperation,
        name: impl Into<String>,
        values: Vec<String>,
    ) -> &mut Self {
        self.changes
            .push(Change::new(operation, Attribute::new(name, values)));
        self
    }

    /// Splits the changes into `(add, replace, delete)`.
    pub fn classify(&self) -> (Vec<Attribute>, Vec<Attribute>, Vec<Attribute>) {
        classify(&self.changes)
    }

    /// Reads a modify request sent by a client.
    pub fn decode(op: &Packet) -> Result<Self, ProtocolError> {
        if !op.is(Class::Application, application::MODIFY_REQUEST) {
            return Err(ProtocolError::UnexpectedOperation(op.tag));
        }
        let [dn, changes] = op.children.as_slice() else {
            return Err(ProtocolError::InvalidPacket);
        };
        Ok(Self {
            dn: dn
                .as_str()
                .map_err(|_| ProtocolError::InvalidUtf8("object DN"))?
                .to_string(),
            changes: changes
                .children
                .iter()
                .map(Change::decode)
                .collect::<Result<_, _>>()?,
            controls: Vec::new(),
        })
    }
}

impl Request for ModifyRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let mut changes = Packet::sequence("Changes");
        for change in &self.changes {
            changes.append_child(change.encode());
        }
        Ok(
            Packet::application(application::MODIFY_REQUEST, "Modify Request")
                .with_child(Packet::string(&self.dn, "DN"))
                .with_child(changes),
        )
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// Partitions changes by operation, keeping their order within each group.
///
/// Returns `(add, replace, delete)`.
pub fn classify(changes: &[Change]) -> (Vec<Attribute>, Vec<Attribute>, Vec<Attribute>) {
    let mut add = Vec::new();
    let mut replace = Vec::new();
    let mut delete = Vec::new();
    for change in changes {
        let group = match change.operation {
            ChangeOperation::Add => &mut add,
            ChangeOperation::Replace => &mut replace,
            ChangeOperation::Delete => &mut delete,
        };
        group.push(change.modification.clone());
    }
    (add, replace, delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_preserves_order() {
        let mut request = ModifyRequest::new("cn=bob,dc=example");
        request
            .add("mail", values(&["a@example.com"]))
            .replace("sn", values(&["Smith"]))
            .delete("description", vec![])
            .add("mail", values(&["b@example.com"]))
            .delete("mail", values(&["old@example.com"]));

        let (add, replace, delete) = request.classify();
        assert_eq!(
            add,
            vec![
                Attribute::new("mail", values(&["a@example.com"])),
                Attribute::new("mail", values(&["b@example.com"])),
            ]
        );
        assert_eq!(replace, vec![Attribute::new("sn", values(&["Smith"]))]);
        assert_eq!(delete.len(), 2);
        assert_eq!(delete[0].name, "description");
        assert_eq!(delete[1].name, "mail");
    }

    #[test]
    fn test_encode_layout() {
        let mut request = ModifyRequest::new("cn=bob");
        request.replace("sn", values(&["Smith"]));
        let packet = request.encode().unwrap();

        assert!(packet.is(Class::Application, application::MODIFY_REQUEST));
        let change = &packet.children[1].children[0];
        assert_eq!(change.children[0].as_int().unwrap(), 2);
        assert_eq!(change.children[1].children[0].as_str().unwrap(), "sn");
    }

    #[test]
    fn test_server_side_decode_and_classify() {
        let mut request = ModifyRequest::new("cn=bob");
        request
            .add("cn", values(&["Bob"]))
            .delete("sn", vec![])
            .replace("mail", values(&["bob@example.com"]));
        let (packet, _) = Packet::decode(&request.encode().unwrap().encode()).unwrap();

        let decoded = ModifyRequest::decode(&packet).unwrap();
        assert_eq!(decoded, request);

        let (add, replace, delete) = decoded.classify();
        assert_eq!((add.len(), replace.len(), delete.len()), (1, 1, 1));
    }

    #[test]
    fn test_unknown_operation() {
        let packet = Packet::application(application::MODIFY_REQUEST, "Modify Request")
            .with_child(Packet::string("cn=bob", "DN"))
            .with_child(
                Packet::sequence("Changes").with_child(
                    Packet::sequence("Change")
                        .with_child(Packet::enumerated(3, "Operation"))
                        .with_child(Attribute::new("uidNumber", values(&["1"])).encode()),
                ),
            );
        assert_eq!(
            ModifyRequest::decode(&packet).unwrap_err(),
            ProtocolError::UnsupportedChangeOperation(3)
        );
    }

    fn change_strategy() -> impl Strategy<Value = Change> {
        (0i64..3, "[a-z]{1,6}", proptest::collection::vec("[a-z]{0,4}", 0..3)).prop_map(
            |(op, name, vals)| {
                Change::new(
                    ChangeOperation::try_from(op).unwrap(),
                    Attribute::new(name, vals),
                )
            },
        )
    }

    proptest! {
        #[test]
        fn classify_is_order_preserving_partition(
            changes in proptest::collection::vec(change_strategy(), 0..20)
        ) {
            let (add, replace, delete) = classify(&changes);
            prop_assert_eq!(add.len() + replace.len() + delete.len(), changes.len());

            let pick = |op: ChangeOperation| -> Vec<Attribute> {
                changes
                    .iter()
                    .filter(|c| c.operation == op)
                    .map(|c| c.modification.clone())
                    .collect()
            };
            prop_assert_eq!(add, pick(ChangeOperation::Add));
            prop_assert_eq!(replace, pick(ChangeOperation::Replace));
            prop_assert_eq!(delete, pick(ChangeOperation::Delete));
        }
    }
}
