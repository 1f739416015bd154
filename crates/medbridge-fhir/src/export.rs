//! 规范化实体 → FHIR transaction Bundle映射
//!
//! Encounter.status由住院状态派生, class由档案类型派生;
//! identifier.system按端点强制配置覆盖。ZBE无线级标准对应,
//! 以专有扩展urn:medbridge:movement携带动作与性质。

use crate::bundle::FhirBundle;
use chrono::{DateTime, SecondsFormat, Utc};
use medbridge_core::models::{
    DossierType, Endpoint, LocationPath, MovementAction, Nature, Patient, VenueStatus,
};
use serde_json::{json, Value};

/// 移动扩展URL（专有, 无FHIR标准对应）
pub const MOVEMENT_EXTENSION_URL: &str = "urn:medbridge:movement";

/// FHIR标识符来源
#[derive(Debug, Clone)]
pub struct FhirIdentifier {
    pub value: String,
    pub system: Option<String>,
    pub oid: Option<String>,
    pub type_code: &'static str,                 // PI | AN | VN
}

impl FhirIdentifier {
    /// 解析system: 端点强制system → 端点强制OID (urn:oid:) → 命名空间system
    fn resolved_system(&self, endpoint: Option<&Endpoint>) -> Option<String> {
        if let Some(ep) = endpoint {
            if let Some(system) = &ep.forced_identifier_system {
                return Some(system.clone());
            }
            if let Some(oid) = &ep.forced_identifier_oid {
                return Some(format!("urn:oid:{oid}"));
            }
        }
        self.system
            .clone()
            .or_else(|| self.oid.as_ref().map(|o| format!("urn:oid:{o}")))
    }

    fn to_json(&self, endpoint: Option<&Endpoint>) -> Value {
        let mut ident = json!({
            "value": self.value,
            "type": {
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/v2-0203",
                    "code": self.type_code
                }]
            }
        });
        if let Some(system) = self.resolved_system(endpoint) {
            ident["system"] = json!(system);
        }
        ident
    }
}

/// Bundle生成请求
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub patient: Patient,
    pub ipp: Option<FhirIdentifier>,
    pub nda: Option<FhirIdentifier>,
    pub vn: Option<FhirIdentifier>,
    pub venue_status: VenueStatus,
    pub dossier_type: DossierType,
    pub location: Option<LocationPath>,
    pub organization_code: String,
    pub organization_name: Option<String>,
    pub practitioner_id: Option<String>,
    pub semantic_code: Option<String>,
    pub action: MovementAction,
    pub nature: Option<Nature>,
    pub timestamp: DateTime<Utc>,
}

/// 生成transaction Bundle
pub fn build_transaction_bundle(req: &BundleRequest, endpoint: Option<&Endpoint>) -> FhirBundle {
    let ts = req.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut bundle = FhirBundle::new_transaction(&ts);

    let patient_id = req
        .ipp
        .as_ref()
        .map(|i| i.value.clone())
        .unwrap_or_else(|| req.patient.id.to_string());
    let org_id = format!("ORG-{}", req.organization_code);
    let encounter_id = req
        .nda
        .as_ref()
        .map(|i| i.value.clone())
        .unwrap_or_else(|| "ENC".to_string());

    bundle.push_resource(build_patient(req, &patient_id, endpoint), "Patient");
    bundle.push_resource(build_organization(req, &org_id), "Organization");
    if let Some(location) = &req.location {
        bundle.push_resource(build_location(location, &org_id), "Location");
    }
    if let Some(practitioner_id) = &req.practitioner_id {
        bundle.push_resource(build_practitioner(practitioner_id), "Practitioner");
    }
    bundle.push_resource(
        build_encounter(req, &encounter_id, &patient_id, &org_id, endpoint),
        "Encounter",
    );
    bundle
}

fn build_patient(req: &BundleRequest, patient_id: &str, endpoint: Option<&Endpoint>) -> Value {
    let mut identifiers = Vec::new();
    if let Some(ipp) = &req.ipp {
        identifiers.push(ipp.to_json(endpoint));
    }
    if let Some(nid) = &req.patient.national_id {
        identifiers.push(json!({
            "system": "urn:oid:1.2.250.1.213.1.4.8",
            "value": nid.value
        }));
    }

    let mut patient = json!({
        "resourceType": "Patient",
        "id": patient_id,
        "identifier": identifiers,
        "name": [{
            "family": req.patient.family,
            "given": req.patient.givens
        }],
        "gender": req.patient.sex.fhir_code()
    });
    if let Some(birth) = req.patient.birth_date {
        patient["birthDate"] = json!(birth.format("%Y-%m-%d").to_string());
    }
    if let Some(address) = &req.patient.address {
        patient["address"] = json!([{
            "line": [address],
            "city": req.patient.city,
            "postalCode": req.patient.postal_code,
            "country": req.patient.country
        }]);
    }
    patient
}

fn build_organization(req: &BundleRequest, org_id: &str) -> Value {
    json!({
        "resourceType": "Organization",
        "id": org_id,
        "identifier": [{"system": "urn:medbridge:ej", "value": req.organization_code}],
        "name": req.organization_name.clone().unwrap_or_else(|| req.organization_code.clone()),
        "type": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/organization-type",
                "code": "prov"
            }]
        }]
    })
}

fn build_location(location: &LocationPath, org_id: &str) -> Value {
    json!({
        "resourceType": "Location",
        "id": format!("LOC-{}", location.point_of_care),
        "status": "active",
        "name": location.to_string(),
        "mode": "instance",
        "managingOrganization": {"reference": format!("Organization/{org_id}")}
    })
}

fn build_practitioner(practitioner_id: &str) -> Value {
    json!({
        "resourceType": "Practitioner",
        "id": format!("PRACT-{practitioner_id}"),
        "identifier": [{"system": "urn:medbridge:rpps", "value": practitioner_id}]
    })
}

fn build_encounter(
    req: &BundleRequest,
    encounter_id: &str,
    patient_id: &str,
    org_id: &str,
    endpoint: Option<&Endpoint>,
) -> Value {
    let mut identifiers = Vec::new();
    if let Some(nda) = &req.nda {
        identifiers.push(nda.to_json(endpoint));
    }
    if let Some(vn) = &req.vn {
        identifiers.push(vn.to_json(endpoint));
    }

    let mut locations = Vec::new();
    if let Some(location) = &req.location {
        locations.push(json!({
            "location": {"reference": format!("Location/LOC-{}", location.point_of_care)}
        }));
    }

    let mut encounter = json!({
        "resourceType": "Encounter",
        "id": encounter_id,
        "identifier": identifiers,
        "status": req.venue_status.fhir_status(),
        "class": {
            "system": "http://terminology.hl7.org/CodeSystem/v3-ActCode",
            "code": req.dossier_type.fhir_class()
        },
        "subject": {"reference": format!("Patient/{patient_id}")},
        "serviceProvider": {"reference": format!("Organization/{org_id}")},
        "location": locations
    });

    // 专有移动扩展
    let mut parts = vec![json!({"url": "action", "valueCode": req.action.as_str()})];
    if let Some(nature) = req.nature {
        parts.push(json!({"url": "nature", "valueCode": nature.as_str()}));
    }
    if let Some(semantic) = &req.semantic_code {
        parts.push(json!({"url": "semantic", "valueCode": semantic}));
    }
    encounter["extension"] = json!([{
        "url": MOVEMENT_EXTENSION_URL,
        "extension": parts
    }]);
    encounter
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::models::{EndpointKind, Sex};

    fn sample_request() -> BundleRequest {
        BundleRequest {
            patient: Patient::new("DOE", vec!["JOHN".to_string()], Sex::Male),
            ipp: Some(FhirIdentifier {
                value: "IPP-42".into(),
                system: Some("urn:medbridge:ipp".into()),
                oid: None,
                type_code: "PI",
            }),
            nda: Some(FhirIdentifier {
                value: "NDA-7".into(),
                system: Some("urn:medbridge:nda".into()),
                oid: None,
                type_code: "AN",
            }),
            vn: Some(FhirIdentifier {
                value: "VN-9".into(),
                system: Some("urn:medbridge:vn".into()),
                oid: None,
                type_code: "VN",
            }),
            venue_status: VenueStatus::Active,
            dossier_type: DossierType::Hospitalise,
            location: Some(LocationPath::parse("CARD^101^1").unwrap()),
            organization_code: "EJ-001".into(),
            organization_name: Some("CH Test".into()),
            practitioner_id: None,
            semantic_code: Some("ADMISSION_CONFIRMED".into()),
            action: MovementAction::Insert,
            nature: Some(Nature::S),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_bundle_resource_set() {
        let bundle = build_transaction_bundle(&sample_request(), None);
        assert_eq!(bundle.bundle_type(), Some("transaction"));
        assert_eq!(bundle.resources_of_type("Patient").len(), 1);
        assert_eq!(bundle.resources_of_type("Organization").len(), 1);
        assert_eq!(bundle.resources_of_type("Location").len(), 1);
        assert_eq!(bundle.resources_of_type("Encounter").len(), 1);
    }

    #[test]
    fn test_encounter_status_and_class() {
        let bundle = build_transaction_bundle(&sample_request(), None);
        let encounter = bundle.resources_of_type("Encounter")[0];
        assert_eq!(encounter["status"], "in-progress");
        assert_eq!(encounter["class"]["code"], "IMP");
        assert_eq!(encounter["identifier"][1]["type"]["coding"][0]["code"], "VN");
        assert_eq!(
            encounter["extension"][0]["url"],
            MOVEMENT_EXTENSION_URL
        );
    }

    #[test]
    fn test_endpoint_system_override() {
        let mut endpoint = Endpoint::new("fhir-target", EndpointKind::FhirClient);
        endpoint.forced_identifier_system = Some("https://target.example/ids".into());
        let bundle = build_transaction_bundle(&sample_request(), Some(&endpoint));
        let patient = bundle.resources_of_type("Patient")[0];
        assert_eq!(patient["identifier"][0]["system"], "https://target.example/ids");
    }

    #[test]
    fn test_discharged_maps_to_finished() {
        let mut req = sample_request();
        req.venue_status = VenueStatus::Discharged;
        let bundle = build_transaction_bundle(&req, None);
        let encounter = bundle.resources_of_type("Encounter")[0];
        assert_eq!(encounter["status"], "finished");
    }
}
