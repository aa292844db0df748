// src/policy.rs
//
// Single source of truth for role-based authorization around connections.
// Every route consults these tables instead of matching role numbers inline.

use uuid::Uuid;

pub const REQUEST_STATUS_PENDING: i16 = 0;
pub const REQUEST_STATUS_APPROVED: i16 = 1;
pub const REQUEST_STATUS_REJECTED: i16 = 2;

/// Stored as smallint on care_user.roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Patient,
    Admin,
    OfficeManager,
    Doctor,
    Nurse,
    Sponsor,
}

impl Role {
    pub fn from_i16(v: i16) -> Option<Role> {
        match v {
            0 => Some(Role::Patient),
            1 => Some(Role::Admin),
            2 => Some(Role::OfficeManager),
            3 => Some(Role::Doctor),
            4 => Some(Role::Nurse),
            5 => Some(Role::Sponsor),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            Role::Patient => 0,
            Role::Admin => 1,
            Role::OfficeManager => 2,
            Role::Doctor => 3,
            Role::Nurse => 4,
            Role::Sponsor => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Admin => "admin",
            Role::OfficeManager => "office_manager",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Sponsor => "sponsor",
        }
    }

    pub fn is_staff_admin(self) -> bool {
        matches!(self, Role::Admin | Role::OfficeManager)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPermission {
    Allowed,
    /// Permitted only when requester and target share at least one active
    /// patient connection (nurse -> doctor).
    SharedRosterRequired,
    Denied,
}

/// Who may open a connection request to whom.
pub fn may_request(requester: Role, target: Role) -> RequestPermission {
    use RequestPermission::*;
    match (requester, target) {
        (Role::Admin | Role::OfficeManager, _) => Allowed,
        (Role::Patient, Role::Doctor | Role::Nurse | Role::OfficeManager) => Allowed,
        (Role::Doctor, Role::Patient | Role::Nurse | Role::OfficeManager) => Allowed,
        (Role::Nurse, Role::Patient | Role::OfficeManager) => Allowed,
        (Role::Nurse, Role::Doctor) => SharedRosterRequired,
        _ => Denied,
    }
}

/// Facts about a pending request needed to decide approval authority.
#[derive(Debug, Clone, Copy)]
pub struct RequestFacts {
    pub requester_role: Role,
    pub recipient_id: Uuid,
    pub recipient_role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAuthority {
    Allowed,
    /// Nurse deciding a patient -> doctor request: allowed only if the nurse
    /// shares an active patient connection with that doctor.
    SharedRosterRequired,
    Denied,
}

/// Who may approve or reject a pending request.
pub fn may_decide(approver_id: Uuid, approver: Role, req: RequestFacts) -> DecisionAuthority {
    if approver_id == req.recipient_id {
        return DecisionAuthority::Allowed;
    }
    if approver.is_staff_admin() {
        return DecisionAuthority::Allowed;
    }
    if approver == Role::Nurse
        && req.requester_role == Role::Patient
        && req.recipient_role == Role::Doctor
    {
        return DecisionAuthority::SharedRosterRequired;
    }
    DecisionAuthority::Denied
}

/// Edges are undirected: store the pair ordered so lookups from either side
/// hit the same row. Self-connections are invalid.
pub fn canonical_pair(a: Uuid, b: Uuid) -> Option<(Uuid, Uuid)> {
    if a == b {
        return None;
    }
    if a < b { Some((a, b)) } else { Some((b, a)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_request_targets() {
        assert_eq!(may_request(Role::Patient, Role::Doctor), RequestPermission::Allowed);
        assert_eq!(may_request(Role::Patient, Role::Nurse), RequestPermission::Allowed);
        assert_eq!(may_request(Role::Patient, Role::OfficeManager), RequestPermission::Allowed);
        assert_eq!(may_request(Role::Patient, Role::Patient), RequestPermission::Denied);
        assert_eq!(may_request(Role::Patient, Role::Sponsor), RequestPermission::Denied);
    }

    #[test]
    fn test_doctor_request_targets() {
        assert_eq!(may_request(Role::Doctor, Role::Patient), RequestPermission::Allowed);
        assert_eq!(may_request(Role::Doctor, Role::Doctor), RequestPermission::Denied);
    }

    #[test]
    fn test_nurse_to_doctor_needs_shared_roster() {
        assert_eq!(may_request(Role::Nurse, Role::Patient), RequestPermission::Allowed);
        assert_eq!(
            may_request(Role::Nurse, Role::Doctor),
            RequestPermission::SharedRosterRequired
        );
        assert_eq!(may_request(Role::Nurse, Role::Nurse), RequestPermission::Denied);
    }

    #[test]
    fn test_staff_admin_may_request_anyone() {
        for target in [Role::Patient, Role::Doctor, Role::Nurse, Role::Sponsor, Role::Admin] {
            assert_eq!(may_request(Role::Admin, target), RequestPermission::Allowed);
            assert_eq!(may_request(Role::OfficeManager, target), RequestPermission::Allowed);
        }
    }

    #[test]
    fn test_sponsor_may_not_request() {
        for target in [Role::Patient, Role::Doctor, Role::Nurse, Role::OfficeManager] {
            assert_eq!(may_request(Role::Sponsor, target), RequestPermission::Denied);
        }
    }

    fn patient_to_doctor(recipient_id: Uuid) -> RequestFacts {
        RequestFacts {
            requester_role: Role::Patient,
            recipient_id,
            recipient_role: Role::Doctor,
        }
    }

    #[test]
    fn test_recipient_always_decides_own_request() {
        let doctor = Uuid::from_u128(1);
        assert_eq!(
            may_decide(doctor, Role::Doctor, patient_to_doctor(doctor)),
            DecisionAuthority::Allowed
        );
    }

    #[test]
    fn test_staff_admin_decides_any_request() {
        let doctor = Uuid::from_u128(1);
        let manager = Uuid::from_u128(2);
        assert_eq!(
            may_decide(manager, Role::OfficeManager, patient_to_doctor(doctor)),
            DecisionAuthority::Allowed
        );
        assert_eq!(
            may_decide(manager, Role::Admin, patient_to_doctor(doctor)),
            DecisionAuthority::Allowed
        );
    }

    #[test]
    fn test_unrelated_nurse_needs_shared_roster() {
        let doctor = Uuid::from_u128(1);
        let nurse = Uuid::from_u128(3);
        // Without a shared roster the route rejects this as unauthorized.
        assert_eq!(
            may_decide(nurse, Role::Nurse, patient_to_doctor(doctor)),
            DecisionAuthority::SharedRosterRequired
        );
    }

    #[test]
    fn test_nurse_cannot_decide_other_request_shapes() {
        let recipient = Uuid::from_u128(1);
        let nurse = Uuid::from_u128(3);
        let facts = RequestFacts {
            requester_role: Role::Doctor,
            recipient_id: recipient,
            recipient_role: Role::Patient,
        };
        assert_eq!(may_decide(nurse, Role::Nurse, facts), DecisionAuthority::Denied);
    }

    #[test]
    fn test_unrelated_patient_or_sponsor_denied() {
        let doctor = Uuid::from_u128(1);
        let other = Uuid::from_u128(9);
        assert_eq!(
            may_decide(other, Role::Patient, patient_to_doctor(doctor)),
            DecisionAuthority::Denied
        );
        assert_eq!(
            may_decide(other, Role::Sponsor, patient_to_doctor(doctor)),
            DecisionAuthority::Denied
        );
    }

    #[test]
    fn test_canonical_pair_is_symmetric() {
        let x = Uuid::from_u128(10);
        let y = Uuid::from_u128(20);
        assert_eq!(canonical_pair(x, y), canonical_pair(y, x));
        let (lo, hi) = canonical_pair(x, y).unwrap();
        assert!(lo < hi);
    }

    #[test]
    fn test_canonical_pair_rejects_self() {
        let x = Uuid::from_u128(10);
        assert_eq!(canonical_pair(x, x), None);
    }
}
