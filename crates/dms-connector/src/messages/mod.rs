//! Typed commands, responses and events of the DMS JSON Data Exchange
//! protocol.

pub mod command;
pub mod event;
pub mod kind;
pub mod response;

pub use command::{
    ChangelogRange, ChangelogReadCommand, Command, DeleteCommand, ExtInfo, GetCommand, HistData,
    HistFormat, Query, RenameCommand, SetCommand, SubscribeCommand, UnsubscribeCommand, ValueType,
};
pub use event::{DmsEvent, EventCode, EventMask};
pub use kind::CommandKind;
pub use response::{
    AlarmEntry, ChangelogEntries, ChangelogGroupsResponse, ChangelogReadResponse, CompactSample,
    DeleteResponse, ExtInfos, GetResponse, HistDataSeries, ProtocolEntry, RenameResponse,
    ResponseBody, ResponseCode, ResponsePayload, SetResponse, SubscriptionResponse, TrendSample,
};
