use parsec_shared::{
    BoundingInfo, LocField, LocFieldValue, SpaceInstant, TimedMotionQuaternion, TimedMotionVector,
};

/// The replicated presence fields, in tag order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum LocFieldKind {
    Location,
    Orientation,
    Bounds,
    Mesh,
    Physics,
}

pub const FIELD_KINDS: [LocFieldKind; 5] = [
    LocFieldKind::Location,
    LocFieldKind::Orientation,
    LocFieldKind::Bounds,
    LocFieldKind::Mesh,
    LocFieldKind::Physics,
];

impl LocFieldKind {
    pub fn of(value: &LocFieldValue) -> Self {
        match value {
            LocFieldValue::Location(_) => LocFieldKind::Location,
            LocFieldValue::Orientation(_) => LocFieldKind::Orientation,
            LocFieldValue::Bounds(_) => LocFieldKind::Bounds,
            LocFieldValue::Mesh(_) => LocFieldKind::Mesh,
            LocFieldValue::Physics(_) => LocFieldKind::Physics,
        }
    }

    fn index(&self) -> usize {
        match self {
            LocFieldKind::Location => 0,
            LocFieldKind::Orientation => 1,
            LocFieldKind::Bounds => 2,
            LocFieldKind::Mesh => 3,
            LocFieldKind::Physics => 4,
        }
    }
}

/// One object's presence state: kinematics, bounds, mesh and physics
/// references, and a monotonic sequence number per field. An update applies
/// to a field iff its sequence number is strictly greater than the stored
/// one; everything else about the record is untouched.
#[derive(Clone, PartialEq, Debug)]
pub struct LocRecord {
    pub location: TimedMotionVector,
    pub orientation: TimedMotionQuaternion,
    pub bounds: BoundingInfo,
    pub mesh: String,
    pub physics: String,
    pub aggregate: bool,
    seqnos: [u64; 5],
}

impl LocRecord {
    pub fn new(
        location: TimedMotionVector,
        orientation: TimedMotionQuaternion,
        bounds: BoundingInfo,
        mesh: String,
        physics: String,
    ) -> Self {
        Self {
            location,
            orientation,
            bounds,
            mesh,
            physics,
            aggregate: false,
            seqnos: [1; 5],
        }
    }

    pub fn stationary(t0: SpaceInstant, position: parsec_shared::Vec3, radius: f32) -> Self {
        Self::new(
            TimedMotionVector::stationary(t0, position),
            TimedMotionQuaternion::fixed(t0, parsec_shared::Quat::IDENTITY),
            BoundingInfo::single_object(radius),
            String::new(),
            String::new(),
        )
    }

    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    pub fn seqno(&self, kind: LocFieldKind) -> u64 {
        self.seqnos[kind.index()]
    }

    /// Apply one field update under the strictly-greater rule. Returns
    /// whether the field changed.
    pub fn apply(&mut self, field: &LocField) -> bool {
        let kind = LocFieldKind::of(&field.value);
        if field.seqno <= self.seqnos[kind.index()] {
            return false;
        }
        self.seqnos[kind.index()] = field.seqno;
        match &field.value {
            LocFieldValue::Location(motion) => self.location = *motion,
            LocFieldValue::Orientation(motion) => self.orientation = *motion,
            LocFieldValue::Bounds(bounds) => self.bounds = *bounds,
            LocFieldValue::Mesh(uri) => self.mesh = uri.clone(),
            LocFieldValue::Physics(desc) => self.physics = desc.clone(),
        }
        true
    }

    /// Full snapshot as a field list, for replica creation and migration.
    pub fn to_fields(&self) -> Vec<LocField> {
        vec![
            LocField {
                seqno: self.seqno(LocFieldKind::Location),
                value: LocFieldValue::Location(self.location),
            },
            LocField {
                seqno: self.seqno(LocFieldKind::Orientation),
                value: LocFieldValue::Orientation(self.orientation),
            },
            LocField {
                seqno: self.seqno(LocFieldKind::Bounds),
                value: LocFieldValue::Bounds(self.bounds),
            },
            LocField {
                seqno: self.seqno(LocFieldKind::Mesh),
                value: LocFieldValue::Mesh(self.mesh.clone()),
            },
            LocField {
                seqno: self.seqno(LocFieldKind::Physics),
                value: LocFieldValue::Physics(self.physics.clone()),
            },
        ]
    }

    /// Rebuild a record from a migrated or replicated field list.
    pub fn from_fields(fields: &[LocField], aggregate: bool) -> Self {
        let mut record = Self {
            location: TimedMotionVector::default(),
            orientation: TimedMotionQuaternion::default(),
            bounds: BoundingInfo::default(),
            mesh: String::new(),
            physics: String::new(),
            aggregate,
            seqnos: [0; 5],
        };
        for field in fields {
            record.apply(field);
        }
        record
    }
}
