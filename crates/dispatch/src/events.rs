use courier_core::error::DispatchError;
use courier_core::types::EventPriority;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every business event the router understands.
///
/// The wire form is the dotted string (`safety.alert`); routing, priority
/// and required-field lookups are exhaustive matches so a new variant
/// cannot be added without deciding all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "user.physician.registered")]
    PhysicianRegistered,
    #[serde(rename = "user.investor.registered")]
    InvestorRegistered,
    #[serde(rename = "user.investigator.registered")]
    InvestigatorRegistered,

    #[serde(rename = "study.created")]
    StudyCreated,
    #[serde(rename = "study.enrollment.opened")]
    EnrollmentOpened,
    #[serde(rename = "study.milestone.reached")]
    StudyMilestoneReached,
    #[serde(rename = "study.completed")]
    StudyCompleted,
    #[serde(rename = "study.results.available")]
    StudyResultsAvailable,

    #[serde(rename = "protocol.updated")]
    ProtocolUpdated,
    #[serde(rename = "safety.alert")]
    SafetyAlert,
    #[serde(rename = "recruitment.milestone")]
    RecruitmentMilestone,
    #[serde(rename = "adverse.event")]
    AdverseEvent,

    #[serde(rename = "funding.round.completed")]
    FundingRoundCompleted,
    #[serde(rename = "company.milestone")]
    CompanyMilestone,
    #[serde(rename = "financial.report")]
    FinancialReport,
    #[serde(rename = "risk.alert")]
    RiskAlert,

    #[serde(rename = "email.opened")]
    EmailOpened,
    #[serde(rename = "email.clicked")]
    EmailClicked,
    #[serde(rename = "unsubscribe.requested")]
    UnsubscribeRequested,
}

/// Notification audiences. Engagement events fan out to all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Physician,
    Investor,
    Investigator,
}

impl Audience {
    pub const ALL: [Audience; 3] = [Audience::Physician, Audience::Investor, Audience::Investigator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Physician => "physician",
            Audience::Investor => "investor",
            Audience::Investigator => "investigator",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "physician" => Ok(Audience::Physician),
            "investor" => Ok(Audience::Investor),
            "investigator" => Ok(Audience::Investigator),
            other => Err(DispatchError::UnknownAudience(other.to_string())),
        }
    }
}

use Audience::{Investigator, Investor, Physician};

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PhysicianRegistered => "user.physician.registered",
            EventType::InvestorRegistered => "user.investor.registered",
            EventType::InvestigatorRegistered => "user.investigator.registered",
            EventType::StudyCreated => "study.created",
            EventType::EnrollmentOpened => "study.enrollment.opened",
            EventType::StudyMilestoneReached => "study.milestone.reached",
            EventType::StudyCompleted => "study.completed",
            EventType::StudyResultsAvailable => "study.results.available",
            EventType::ProtocolUpdated => "protocol.updated",
            EventType::SafetyAlert => "safety.alert",
            EventType::RecruitmentMilestone => "recruitment.milestone",
            EventType::AdverseEvent => "adverse.event",
            EventType::FundingRoundCompleted => "funding.round.completed",
            EventType::CompanyMilestone => "company.milestone",
            EventType::FinancialReport => "financial.report",
            EventType::RiskAlert => "risk.alert",
            EventType::EmailOpened => "email.opened",
            EventType::EmailClicked => "email.clicked",
            EventType::UnsubscribeRequested => "unsubscribe.requested",
        }
    }

    /// Default target audiences.
    pub fn routes(&self) -> &'static [Audience] {
        match self {
            EventType::PhysicianRegistered => &[Physician],
            EventType::InvestorRegistered => &[Investor],
            EventType::InvestigatorRegistered => &[Investigator],

            EventType::StudyCreated => &[Physician, Investigator],
            EventType::EnrollmentOpened => &[Physician, Investigator],
            EventType::StudyMilestoneReached => &[Investor, Investigator],
            EventType::StudyCompleted => &[Investor, Investigator],
            EventType::StudyResultsAvailable => &[Investor, Physician],

            EventType::ProtocolUpdated => &[Investigator],
            EventType::SafetyAlert => &[Investigator, Physician],
            EventType::RecruitmentMilestone => &[Investigator],
            EventType::AdverseEvent => &[Investigator],

            EventType::FundingRoundCompleted => &[Investor],
            EventType::CompanyMilestone => &[Investor],
            EventType::FinancialReport => &[Investor],
            EventType::RiskAlert => &[Investor],

            EventType::EmailOpened
            | EventType::EmailClicked
            | EventType::UnsubscribeRequested => &Audience::ALL,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            EventType::SafetyAlert | EventType::AdverseEvent => EventPriority::Critical,
            EventType::RiskAlert | EventType::ProtocolUpdated => EventPriority::High,
            // engagement events carry no entry in the table and take the
            // default like everything else
            _ => EventPriority::Medium,
        }
    }

    /// Fields that must be present in the event data before dispatch.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventType::PhysicianRegistered => &["email", "firstName", "lastName", "specialty"],
            EventType::InvestorRegistered => &["email", "firstName", "lastName", "investorType"],
            EventType::InvestigatorRegistered => {
                &["email", "firstName", "lastName", "investigatorType"]
            }
            EventType::StudyCreated => &["studyId", "title", "specialty"],
            EventType::StudyMilestoneReached => &["studyId", "milestoneId", "title"],
            EventType::FundingRoundCompleted => &["roundType", "amountRaised"],
            EventType::SafetyAlert => &["studyId", "severity", "description"],
            EventType::ProtocolUpdated => &["studyId", "protocolVersion", "changes"],
            _ => &[],
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| DispatchError::UnknownEventType(s.to_string()))
    }
}
