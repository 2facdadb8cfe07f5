pub mod earnings;
pub mod referrals;
pub mod users;
